//! Per-variant allele to allele-code mapping

use crate::{Allele, PgenError, PgenResult, VariantSite, NO_CALL_CODE};
use std::collections::HashMap;

/// Maps each allele of one site to its positional code (reference = 0).
///
/// The no-call allele is always present and maps to [`NO_CALL_CODE`], so the
/// table holds `allele_count + 1` entries.
#[derive(Debug, Clone)]
pub struct AlleleCodeMap {
    codes: HashMap<Allele, i32>,
}

impl AlleleCodeMap {
    pub fn build(site: &VariantSite) -> PgenResult<Self> {
        let mut codes = HashMap::with_capacity(site.allele_count() + 1);
        codes.insert(Allele::NoCall, NO_CALL_CODE);

        for (index, bases) in site.alleles.iter().enumerate() {
            if codes.insert(Allele::Called(bases.clone()), index as i32).is_some() {
                return Err(PgenError::InvalidVariant(format!(
                    "Duplicate allele {} in site {}",
                    bases,
                    site.describe()
                )));
            }
        }

        Ok(Self { codes })
    }

    pub fn code(&self, allele: &Allele) -> Option<i32> {
        self.codes.get(allele).copied()
    }

    /// Resolve a call allele, treating an unknown allele as an encoding defect
    pub fn resolve(&self, allele: &Allele, site: &VariantSite) -> PgenResult<i32> {
        self.code(allele).ok_or_else(|| {
            PgenError::Encoding(format!(
                "Allele {} is not one of the site alleles at {}",
                allele,
                site.describe()
            ))
        })
    }

    /// Table size including the no-call entry
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Number of real alleles, excluding the no-call entry
    pub fn allele_count(&self) -> usize {
        self.codes.len() - 1
    }
}
