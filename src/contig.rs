//! Chromosome naming schemes for the sex and mitochondrial contigs

use clap::ValueEnum;

/// Naming convention used to recognise the X, Y and mitochondrial contigs.
///
/// The two `chr`-prefixed schemes only differ in the mitochondrial name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ChromosomeScheme {
    /// chrX, chrY, chrM
    #[default]
    ChrM,
    /// chrX, chrY, chrMT
    ChrMt,
    /// X, Y, MT
    Plain,
}

impl ChromosomeScheme {
    pub fn x_name(&self) -> &'static str {
        match self {
            ChromosomeScheme::ChrM | ChromosomeScheme::ChrMt => "chrX",
            ChromosomeScheme::Plain => "X",
        }
    }

    pub fn y_name(&self) -> &'static str {
        match self {
            ChromosomeScheme::ChrM | ChromosomeScheme::ChrMt => "chrY",
            ChromosomeScheme::Plain => "Y",
        }
    }

    pub fn mito_name(&self) -> &'static str {
        match self {
            ChromosomeScheme::ChrM => "chrM",
            ChromosomeScheme::ChrMt => "chrMT",
            ChromosomeScheme::Plain => "MT",
        }
    }

    /// Whether haploid calls on this contig are expected (X or Y)
    pub fn is_sex_chromosome(&self, chrom: &str) -> bool {
        chrom == self.x_name() || chrom == self.y_name()
    }

    pub fn is_mitochondrial(&self, chrom: &str) -> bool {
        chrom == self.mito_name()
    }
}
