//! # pgenwrite-rs - PGEN genotype writer
//!
//! Adapts a stream of VCF-style variant records into the flat allele-code and
//! phase buffers consumed by a PGEN storage engine, and produces the `.pvar`
//! and `.psam` companion files that make the primary artifact usable.

pub mod alleles;
pub mod buffers;
pub mod companion;
pub mod contig;
pub mod engine;
pub mod ploidy;
pub mod samples;
pub mod utils;
pub mod vcf;
pub mod writer;

use serde::Serialize;

pub use contig::ChromosomeScheme;
pub use engine::{EngineFactory, StorageEngine, VariantCount, WriteFlags, WriteMode};
pub use ploidy::PloidyPolicy;
pub use writer::{AddOutcome, CloseSummary, PgenWriter};

/// Allele code written for a missing call
pub const NO_CALL_CODE: i32 = -9;

/// Largest number of alternate alleles the storage engine accepts
pub const MAX_ALT_ALLELES: usize = 254;

/// One allele of a genotype call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Allele {
    Called(String),
    NoCall,
}

impl Allele {
    pub fn called(bases: impl Into<String>) -> Self {
        Allele::Called(bases.into())
    }
}

impl std::fmt::Display for Allele {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allele::Called(bases) => write!(f, "{}", bases),
            Allele::NoCall => write!(f, "."),
        }
    }
}

/// A single sample's genotype call at one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeCall {
    pub sample: String,
    pub alleles: Vec<Allele>,
    pub phased: bool,
}

impl GenotypeCall {
    pub fn new(sample: impl Into<String>, alleles: Vec<Allele>, phased: bool) -> Self {
        Self {
            sample: sample.into(),
            alleles,
            phased,
        }
    }

    pub fn ploidy(&self) -> usize {
        self.alleles.len()
    }
}

impl std::fmt::Display for GenotypeCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.phased { "|" } else { "/" };
        let alleles: Vec<String> = self.alleles.iter().map(|a| a.to_string()).collect();
        write!(f, "{} {}", self.sample, alleles.join(sep))
    }
}

/// Represents one input record: the site plus its per-sample genotype calls.
///
/// `alleles[0]` is the reference allele; allele values are expected to be distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSite {
    pub chrom: String,
    pub pos: u32,
    pub id: String,
    pub alleles: Vec<String>,
    pub qual: String,
    pub filter: String,
    pub info: String,
    pub genotypes: Vec<GenotypeCall>,
}

impl VariantSite {
    pub fn new(chrom: impl Into<String>, pos: u32, alleles: Vec<String>) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
            id: ".".to_string(),
            alleles,
            qual: ".".to_string(),
            filter: ".".to_string(),
            info: ".".to_string(),
            genotypes: Vec::new(),
        }
    }

    pub fn with_genotypes(mut self, genotypes: Vec<GenotypeCall>) -> Self {
        self.genotypes = genotypes;
        self
    }

    pub fn allele_count(&self) -> usize {
        self.alleles.len()
    }

    /// `chrom:pos`, used to identify the site in errors and logs
    pub fn locus(&self) -> String {
        format!("{}:{}", self.chrom, self.pos)
    }

    /// Site description without genotypes
    pub fn describe(&self) -> String {
        format!("{} id={} alleles=[{}]", self.locus(), self.id, self.alleles.join(","))
    }

    pub fn genotype_for(&self, sample: &str) -> Option<&GenotypeCall> {
        self.genotypes.iter().find(|g| g.sample == sample)
    }
}

/// Running totals of records excluded or degraded by the writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    pub dropped_variants: u64,
    pub dropped_samples: u64,
}

/// Configuration for a [`PgenWriter`]
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub write_mode: WriteMode,
    pub write_flags: WriteFlags,
    pub variant_count: VariantCount,
    /// Variants with more alleles than this are dropped at admission
    pub max_alt_alleles: usize,
    pub ploidy_policy: PloidyPolicy,
    pub chromosome_scheme: ChromosomeScheme,
    /// Log each drop/degradation and record it in the drop-event file
    pub log_drops: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::SeparateIndex,
            write_flags: WriteFlags::default(),
            variant_count: VariantCount::Unknown,
            max_alt_alleles: MAX_ALT_ALLELES,
            ploidy_policy: PloidyPolicy::Strict,
            chromosome_scheme: ChromosomeScheme::default(),
            log_drops: false,
        }
    }
}

/// Error types for the pgenwrite library
#[derive(Debug, thiserror::Error)]
pub enum PgenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("PGEN only supports diploid samples and sample {sample} has ploidy = {ploidy} at {locus}")]
    Ploidy {
        sample: String,
        ploidy: usize,
        locus: String,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Buffer overflow at position {position} (capacity {capacity}) for sample {sample} allele {allele} at {locus}")]
    Overflow {
        position: usize,
        capacity: usize,
        sample: String,
        allele: String,
        locus: String,
    },

    #[error("Storage engine error: {0}")]
    Engine(String),

    #[error("No variants were written to {0}; an empty PGEN is not a valid output")]
    EmptyOutput(String),

    #[error("Invalid variant format: {0}")]
    InvalidVariant(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Writer is unusable after an earlier fatal error: {0}")]
    WriterFailed(String),
}

impl PgenError {
    /// Errors that only invalidate the current record; the writer can accept the next one.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PgenError::Ploidy { .. } | PgenError::InvalidVariant(_))
    }
}

pub type PgenResult<T> = Result<T, PgenError>;
