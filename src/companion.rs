//! Companion files written next to the primary `.pgen`: the `.pvar` site list,
//! the `.psam` sample list and the optional drop-event log.

use crate::{samples::SampleRegistry, utils::sibling_with_suffix, PgenResult, VariantSite};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const PGEN_EXTENSION: &str = "pgen";
pub const PGEN_INDEX_SUFFIX: &str = ".pgen.pgi";
pub const PVAR_SUFFIX: &str = ".pvar";
pub const PSAM_SUFFIX: &str = ".psam";
pub const DROP_LOG_SUFFIX: &str = ".drops.tsv";

const PSAM_HEADER_LINE: &str = "#IID\tSEX";
const PSAM_SEX_MISSING: &str = "N/A";
const PVAR_COLUMN_LINE: &str = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO";
const DEFAULT_FILEFORMAT_LINE: &str = "##fileformat=VCFv4.2";

/// The set of files sharing one base name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgenFileSet {
    pub pgen: PathBuf,
    pub index: PathBuf,
    pub pvar: PathBuf,
    pub psam: PathBuf,
    pub drop_log: PathBuf,
}

impl PgenFileSet {
    pub fn from_pgen<P: AsRef<Path>>(pgen: P) -> Self {
        let pgen = pgen.as_ref();
        Self {
            pgen: pgen.to_path_buf(),
            index: sibling_with_suffix(pgen, PGEN_INDEX_SUFFIX),
            pvar: sibling_with_suffix(pgen, PVAR_SUFFIX),
            psam: sibling_with_suffix(pgen, PSAM_SUFFIX),
            drop_log: sibling_with_suffix(pgen, DROP_LOG_SUFFIX),
        }
    }
}

/// Write the complete `.psam`, one line per sample in registry order
pub fn write_sample_list<P: AsRef<Path>>(path: P, samples: &SampleRegistry) -> PgenResult<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    writeln!(out, "{}", PSAM_HEADER_LINE)?;
    for sample in samples.iter() {
        writeln!(out, "{}\t{}", sample, PSAM_SEX_MISSING)?;
    }
    out.flush()?;
    Ok(())
}

/// Sites-only VCF writer for the `.pvar`
pub struct SiteListWriter {
    out: BufWriter<File>,
    sites_written: u64,
}

impl SiteListWriter {
    /// Create the file and write its header immediately
    pub fn create<P: AsRef<Path>>(path: P, meta_lines: &[String]) -> PgenResult<Self> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);

        if !meta_lines.iter().any(|l| l.starts_with("##fileformat=")) {
            writeln!(out, "{}", DEFAULT_FILEFORMAT_LINE)?;
        }
        for line in meta_lines {
            writeln!(out, "{}", line)?;
        }
        writeln!(out, "{}", PVAR_COLUMN_LINE)?;

        Ok(Self {
            out,
            sites_written: 0,
        })
    }

    pub fn add(&mut self, site: &VariantSite) -> PgenResult<()> {
        let alt = if site.alleles.len() > 1 {
            site.alleles[1..].join(",")
        } else {
            ".".to_string()
        };
        let reference = site.alleles.first().map(String::as_str).unwrap_or(".");

        writeln!(
            self.out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            site.chrom, site.pos, site.id, reference, alt, site.qual, site.filter, site.info
        )?;
        self.sites_written += 1;
        Ok(())
    }

    pub fn sites_written(&self) -> u64 {
        self.sites_written
    }

    pub fn close(mut self) -> PgenResult<u64> {
        self.out.flush()?;
        Ok(self.sites_written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropKind {
    Variant,
    Sample,
}

/// One row of the drop-event log
#[derive(Debug, Clone, Serialize)]
pub struct DropEvent {
    pub kind: DropKind,
    pub chrom: String,
    pub pos: u32,
    pub sample: Option<String>,
    pub detail: String,
}

impl DropEvent {
    pub fn variant(site: &VariantSite, max_alt_alleles: usize) -> Self {
        Self {
            kind: DropKind::Variant,
            chrom: site.chrom.clone(),
            pos: site.pos,
            sample: None,
            detail: format!(
                "allele count {} exceeds max {}",
                site.allele_count(),
                max_alt_alleles
            ),
        }
    }

    pub fn sample(site: &VariantSite, sample: &str, ploidy: usize) -> Self {
        Self {
            kind: DropKind::Sample,
            chrom: site.chrom.clone(),
            pos: site.pos,
            sample: Some(sample.to_string()),
            detail: format!("ploidy {} recoded as no-call", ploidy),
        }
    }
}

/// Tab-separated log of dropped variants and degraded samples
pub struct DropLog {
    writer: csv::Writer<File>,
}

impl DropLog {
    pub fn create<P: AsRef<Path>>(path: P) -> PgenResult<Self> {
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path.as_ref())?;
        Ok(Self { writer })
    }

    pub fn record(&mut self, event: &DropEvent) -> PgenResult<()> {
        self.writer.serialize(event)?;
        Ok(())
    }

    pub fn close(mut self) -> PgenResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
