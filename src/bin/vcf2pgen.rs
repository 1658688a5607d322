//! CLI binary converting a VCF into a PGEN file set (.pgen, .pvar, .psam)

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use pgenwrite_rs::{
    engine::{EngineFactory, MemoryEngineFactory, RawFileEngineFactory},
    utils::{ensure_parent_dirs, format_file_size, local_path, validate_file_readable, Timer},
    vcf::{count_vcf_records, VcfReader},
    AddOutcome, ChromosomeScheme, CloseSummary, PgenError, PgenWriter, PloidyPolicy, VariantCount,
    WriteFlags, WriteMode, WriterConfig, MAX_ALT_ALLELES,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "vcf2pgen")]
#[command(about = "Convert a VCF into a PGEN file set")]
#[command(long_about = "
vcf2pgen reads a VCF (plain or gzip-compressed) and writes a PGEN file set next
to the requested .pgen path:

- <base>.pgen      packed genotypes, written by the storage engine
- <base>.pvar      sites-only list of every variant the engine accepted
- <base>.psam      sample list, in VCF header order
- <base>.pgen.pgi  variant index (separate-index write mode only)
- <base>.drops.tsv dropped variants and degraded samples (--log-drops only)

Variants with more alleles than --max-alt-alleles are skipped and counted.
Haploid calls on the X and Y contigs are stored as homozygous diploid calls;
any other non-diploid call fails the run unless --ploidy-policy lenient is set,
in which case it is recoded as missing.

The backward-seek write mode needs the exact variant count up front: pass
--variant-count or let --count-variants scan the input once before writing.
")]
struct Args {
    /// Path to the input VCF file
    #[arg(long, value_name = "FILE")]
    input_vcf: PathBuf,

    /// Path to the output .pgen file
    #[arg(long, value_name = "FILE")]
    output: String,

    /// Engine write mode
    #[arg(long, value_enum, default_value_t = WriteMode::SeparateIndex)]
    write_mode: WriteMode,

    /// Exact number of variants in the input, if known
    #[arg(long, conflicts_with = "count_variants")]
    variant_count: Option<u64>,

    /// Scan the input once to count variants before writing
    #[arg(long)]
    count_variants: bool,

    /// Variants with more alleles than this are dropped
    #[arg(long, default_value_t = MAX_ALT_ALLELES)]
    max_alt_alleles: usize,

    /// Handling of non-diploid calls outside the X/Y contigs
    #[arg(long, value_enum, default_value_t = PloidyPolicy::Strict)]
    ploidy_policy: PloidyPolicy,

    /// Naming convention of the sex and mitochondrial contigs
    #[arg(long, value_enum, default_value_t = ChromosomeScheme::ChrM)]
    chromosome_scheme: ChromosomeScheme,

    /// Ask the engine to keep phasing information
    #[arg(long)]
    preserve_phasing: bool,

    /// Allow variants with more than one alternate allele
    #[arg(long)]
    multi_allelic: bool,

    /// Log every dropped variant and degraded sample, and write <base>.drops.tsv
    #[arg(long)]
    log_drops: bool,

    /// Encode everything but keep the genotypes in memory instead of writing the .pgen
    #[arg(long)]
    dry_run: bool,

    /// Write the final counts as a TSV to this file
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force overwrite of output file if it exists
    #[arg(short, long)]
    force: bool,
}

fn write_summary(path: &Path, summary: &CloseSummary) -> anyhow::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("failed to create summary file {:?}", path))?;
    writer.serialize(summary)?;
    writer.flush()?;
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Starting VCF to PGEN conversion");
    log::info!("Input VCF: {:?}", args.input_vcf);
    log::info!("Output PGEN: {}", args.output);

    validate_file_readable(&args.input_vcf)?;

    let output_path = local_path(&args.output)?;
    if output_path.exists() && !args.force && !args.dry_run {
        return Err(PgenError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("Output file {:?} already exists. Use --force to overwrite.", output_path),
        ))
        .into());
    }
    ensure_parent_dirs(&output_path)?;

    let variant_count = match (args.variant_count, args.count_variants) {
        (Some(n), _) => VariantCount::Known(n),
        (None, true) => {
            let _timer = Timer::new("Counting input variants");
            let n = count_vcf_records(&args.input_vcf)?;
            log::info!("Input contains {} variants", n);
            VariantCount::Known(n)
        }
        (None, false) => VariantCount::Unknown,
    };

    let config = WriterConfig {
        write_mode: args.write_mode,
        write_flags: WriteFlags {
            preserve_phasing: args.preserve_phasing,
            multi_allelic: args.multi_allelic,
        },
        variant_count,
        max_alt_alleles: args.max_alt_alleles,
        ploidy_policy: args.ploidy_policy,
        chromosome_scheme: args.chromosome_scheme,
        log_drops: args.log_drops,
    };

    let mut reader = VcfReader::new(&args.input_vcf)?;
    log::info!("Input has {} samples", reader.header().samples.len());

    let factory: Box<dyn EngineFactory> = if args.dry_run {
        Box::new(MemoryEngineFactory::new())
    } else {
        Box::new(RawFileEngineFactory)
    };
    let mut writer = PgenWriter::create(&args.output, reader.header(), config, factory.as_ref())?;

    let timer = Timer::new("Writing variants");
    let mut records = 0u64;
    for site in reader.records() {
        let site = site?;
        records += 1;
        match writer.add(&site) {
            Ok(AddOutcome::Written { degraded_samples }) if degraded_samples > 0 => {
                log::debug!("{} samples recoded as no-call at {}", degraded_samples, site.locus());
            }
            Ok(_) => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to write variant at {}", site.locus())));
            }
        }
    }
    drop(timer);

    let summary = writer.close()?;
    log::info!("Conversion completed successfully");
    log::info!("  Records read: {}", records);
    log::info!("  Variants written: {}", summary.written_variants);
    log::info!("  Variants dropped: {}", summary.dropped_variants);
    log::info!("  Samples recoded as no-call: {}", summary.dropped_samples);

    if !args.dry_run {
        if let Ok(size) = std::fs::metadata(&output_path).map(|m| m.len()) {
            log::info!("Output PGEN size: {}", format_file_size(size));
        }
    }

    if let Some(path) = &args.summary {
        write_summary(path, &summary)?;
    }

    println!(
        "{}\twritten={}\tdropped_variants={}\tdropped_samples={}",
        args.output, summary.written_variants, summary.dropped_variants, summary.dropped_samples
    );
    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: anyhow::Error) -> ! {
    match error.downcast_ref::<PgenError>() {
        Some(PgenError::FileNotFound(path)) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        Some(PgenError::InvalidVariant(msg)) => {
            eprintln!("Error: Invalid variant data: {}", msg);
            eprintln!("Please check that your VCF file is properly formatted.");
        }
        Some(PgenError::Configuration(msg)) => {
            eprintln!("Error: Invalid configuration: {}", msg);
            eprintln!("Please check the output path, write mode and allele limit.");
        }
        Some(PgenError::Ploidy { .. }) => {
            eprintln!("Error: {:#}", error);
            eprintln!("Use --ploidy-policy lenient to recode non-diploid calls as missing.");
        }
        Some(PgenError::EmptyOutput(path)) => {
            eprintln!("Error: No variants were written to {}", path);
            eprintln!("An empty PGEN is not a valid output; check the allele limits and the input.");
        }
        Some(PgenError::Io(e)) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
        }
        _ => {
            eprintln!("Error: {:#}", error);
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vcf2pgen", "--input-vcf", "in.vcf", "--output", "out.pgen"]);
        assert_eq!(args.write_mode, WriteMode::SeparateIndex);
        assert_eq!(args.max_alt_alleles, MAX_ALT_ALLELES);
        assert_eq!(args.ploidy_policy, PloidyPolicy::Strict);
        assert!(args.variant_count.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn test_args_value_enums() {
        let args = Args::parse_from([
            "vcf2pgen",
            "--input-vcf",
            "in.vcf",
            "--output",
            "out.pgen",
            "--write-mode",
            "backward-seek",
            "--ploidy-policy",
            "lenient",
            "--chromosome-scheme",
            "chr-mt",
            "--variant-count",
            "12",
        ]);
        assert_eq!(args.write_mode, WriteMode::BackwardSeek);
        assert_eq!(args.ploidy_policy, PloidyPolicy::Lenient);
        assert_eq!(args.chromosome_scheme, ChromosomeScheme::ChrMt);
        assert_eq!(args.variant_count, Some(12));
    }

    #[test]
    fn test_write_summary() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let summary = CloseSummary {
            written_variants: 3,
            dropped_variants: 1,
            dropped_samples: 0,
            sites_written: 3,
        };
        write_summary(&path, &summary).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "written_variants\tdropped_variants\tdropped_samples\tsites_written\n3\t1\t0\t3\n"
        );
    }

    #[test]
    fn test_vcf_to_memory_engine() {
        let mut vcf_file = NamedTempFile::new().unwrap();
        writeln!(vcf_file, "##fileformat=VCFv4.2").unwrap();
        let columns = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2";
        writeln!(vcf_file, "{}", columns).unwrap();
        writeln!(vcf_file, "chr1\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0/1\t1/1").unwrap();
        writeln!(vcf_file, "chrX\t200\t.\tG\tC\t.\tPASS\t.\tGT\t1\t0/1").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.pgen");
        let factory = MemoryEngineFactory::new();

        let mut reader = VcfReader::new(vcf_file.path()).unwrap();
        let mut writer = PgenWriter::create(
            output.to_str().unwrap(),
            reader.header(),
            WriterConfig::default(),
            &factory,
        )
        .unwrap();
        for site in reader.records() {
            writer.add(&site.unwrap()).unwrap();
        }
        let summary = writer.close().unwrap();
        assert_eq!(summary.written_variants, 2);

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants[0].alleles, vec![0, 1, 1, 1]);
        assert_eq!(store.variants[1].alleles, vec![1, 1, 0, 1]);
    }
}
