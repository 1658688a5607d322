//! Per-sample ploidy normalisation.
//!
//! The storage format is strictly diploid. Haploid calls on the X or Y contig are
//! expanded to homozygous diploid, absent calls become no-calls, and any other
//! non-diploid call is either rejected or degraded to a no-call depending on the
//! [`PloidyPolicy`].

use crate::{
    alleles::AlleleCodeMap, buffers::PackedCall, ChromosomeScheme, GenotypeCall, PgenError,
    PgenResult, VariantSite, NO_CALL_CODE,
};
use clap::ValueEnum;

/// How calls that are neither diploid nor haploid-on-X/Y are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PloidyPolicy {
    /// Fail the record
    #[default]
    Strict,
    /// Recode the sample as no-call and count it
    Lenient,
}

/// Result of normalising one sample's call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedCall {
    pub packed: PackedCall,
    /// True when a lenient policy replaced the call with a no-call
    pub degraded: bool,
}

const NO_CALL: PackedCall = PackedCall {
    codes: [NO_CALL_CODE, NO_CALL_CODE],
    phased: false,
};

/// Normalise `call` (the genotype of `sample` at `site`, if any) to a diploid pair of codes
pub fn normalize_call(
    sample: &str,
    call: Option<&GenotypeCall>,
    site: &VariantSite,
    allele_map: &AlleleCodeMap,
    scheme: ChromosomeScheme,
    policy: PloidyPolicy,
) -> PgenResult<NormalizedCall> {
    let call = match call {
        Some(call) => call,
        None => {
            return Ok(NormalizedCall {
                packed: NO_CALL,
                degraded: false,
            })
        }
    };

    let ploidy = call.ploidy();
    if ploidy == 1 && scheme.is_sex_chromosome(&site.chrom) {
        let code = match call.alleles.as_slice() {
            [only] => allele_map.resolve(only, site)?,
            _ => {
                return Err(PgenError::Encoding(format!(
                    "Haploid call for sample {} at {} does not have exactly one allele",
                    sample,
                    site.locus()
                )))
            }
        };
        return Ok(NormalizedCall {
            packed: PackedCall {
                codes: [code, code],
                phased: call.phased,
            },
            degraded: false,
        });
    }

    if ploidy != 2 {
        return match policy {
            PloidyPolicy::Strict => Err(PgenError::Ploidy {
                sample: sample.to_string(),
                ploidy,
                locus: site.describe(),
            }),
            PloidyPolicy::Lenient => Ok(NormalizedCall {
                packed: NO_CALL,
                degraded: true,
            }),
        };
    }

    let first = allele_map.resolve(&call.alleles[0], site)?;
    let second = allele_map.resolve(&call.alleles[1], site)?;
    Ok(NormalizedCall {
        packed: PackedCall {
            codes: [first, second],
            phased: call.phased,
        },
        degraded: false,
    })
}
