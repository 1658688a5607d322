//! PGEN writer: admission control, per-variant encoding and the close sequence

use crate::{
    alleles::AlleleCodeMap,
    buffers::{GenotypePacker, PackedCall},
    companion::{
        write_sample_list, DropEvent, DropLog, PgenFileSet, SiteListWriter, PGEN_EXTENSION,
    },
    engine::{EngineFactory, OpenParams, StorageEngine, VariantCount},
    ploidy::normalize_call,
    samples::SampleRegistry,
    utils::{has_extension, local_path},
    vcf::VcfHeader,
    DropCounters, GenotypeCall, PgenError, PgenResult, VariantSite, WriterConfig, MAX_ALT_ALLELES,
    NO_CALL_CODE,
};
use serde::Serialize;
use std::collections::HashMap;

/// Result of a successful [`PgenWriter::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Variant persisted by the engine and listed in the `.pvar`
    Written { degraded_samples: u64 },
    /// Variant had too many alleles and was skipped
    Dropped { allele_count: usize },
}

/// Final counts reported by [`PgenWriter::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloseSummary {
    pub written_variants: u64,
    pub dropped_variants: u64,
    pub dropped_samples: u64,
    pub sites_written: u64,
}

/// Validate writer configuration parameters
pub fn validate_writer_config(config: &WriterConfig) -> PgenResult<()> {
    if config.max_alt_alleles > MAX_ALT_ALLELES {
        return Err(PgenError::Configuration(format!(
            "Requested max alternate alleles of ({}) exceeds the supported pgen max of {}",
            config.max_alt_alleles, MAX_ALT_ALLELES
        )));
    }

    if config.write_mode.requires_known_count() && config.variant_count == VariantCount::Unknown {
        return Err(PgenError::Configuration(format!(
            "Write mode {:?} requires an accurate variant count up front",
            config.write_mode
        )));
    }

    Ok(())
}

/// Largest allele count admitted to the engine.
///
/// Without the multi-allelic write flag the engine only accepts biallelic
/// sites, so anything wider is dropped at admission like any over-threshold site.
pub fn admission_limit(config: &WriterConfig) -> usize {
    if config.write_flags.multi_allelic {
        config.max_alt_alleles
    } else {
        config.max_alt_alleles.min(2)
    }
}

/// Codes for a call that has no slot in the registry, without ploidy checks
fn surplus_call(call: &GenotypeCall, allele_map: &AlleleCodeMap) -> PackedCall {
    let mut codes = [NO_CALL_CODE; 2];
    for (slot, allele) in codes.iter_mut().zip(&call.alleles) {
        *slot = allele_map.code(allele).unwrap_or(NO_CALL_CODE);
    }
    PackedCall {
        codes,
        phased: call.phased,
    }
}

/// Writes one PGEN file set from a stream of [`VariantSite`]s.
///
/// Construction opens the engine, writes the complete `.psam` and the `.pvar`
/// header. Every [`add`](Self::add) either drops the variant at admission or
/// encodes it against the sample order captured at construction. The writer must
/// be finished with [`close`](Self::close); a writer dropped without closing
/// leaves an incomplete output behind.
///
/// A fatal error from `add` (anything other than a ploidy rejection or an invalid
/// record) leaves the writer unusable: later `add` calls fail with
/// [`PgenError::WriterFailed`].
pub struct PgenWriter {
    files: PgenFileSet,
    config: WriterConfig,
    samples: SampleRegistry,
    engine: Option<Box<dyn StorageEngine>>,
    packer: GenotypePacker,
    site_writer: Option<SiteListWriter>,
    drop_log: Option<DropLog>,
    counters: DropCounters,
    failure: Option<String>,
}

impl PgenWriter {
    pub fn create(
        output: &str,
        header: &VcfHeader,
        config: WriterConfig,
        factory: &dyn EngineFactory,
    ) -> PgenResult<Self> {
        let pgen_path = local_path(output)?;
        if !has_extension(&pgen_path, PGEN_EXTENSION) {
            return Err(PgenError::Configuration(format!(
                "Invalid pgen file name: {}. pgen files must use the .{} extension",
                output, PGEN_EXTENSION
            )));
        }
        validate_writer_config(&config)?;

        let samples = SampleRegistry::new(header.samples.clone())?;
        let files = PgenFileSet::from_pgen(&pgen_path);

        let params = OpenParams {
            path: files.pgen.clone(),
            write_mode: config.write_mode,
            write_flags: config.write_flags,
            variant_count: config.variant_count,
            sample_count: samples.len(),
            max_alt_alleles: config.max_alt_alleles,
        };
        let engine = factory.open(&params)?;
        let packer = GenotypePacker::for_samples(samples.len());

        // the engine needs sample identity before any variant is written
        write_sample_list(&files.psam, &samples)?;
        let site_writer = SiteListWriter::create(&files.pvar, &header.meta_lines)?;
        let drop_log = if config.log_drops {
            Some(DropLog::create(&files.drop_log)?)
        } else {
            None
        };

        log::info!(
            "Opened PGEN writer for {:?}: {} samples, mode {:?}, variant count {:?}",
            files.pgen,
            samples.len(),
            config.write_mode,
            config.variant_count
        );

        Ok(Self {
            files,
            config,
            samples,
            engine: Some(engine),
            packer,
            site_writer: Some(site_writer),
            drop_log,
            counters: DropCounters::default(),
            failure: None,
        })
    }

    /// Admit, encode and hand one variant to the engine
    pub fn add(&mut self, site: &VariantSite) -> PgenResult<AddOutcome> {
        if let Some(reason) = &self.failure {
            return Err(PgenError::WriterFailed(reason.clone()));
        }

        let result = self.admit_and_write(site);
        if let Err(e) = &result {
            if !e.is_recoverable() {
                self.failure = Some(e.to_string());
            }
        }
        result
    }

    fn admit_and_write(&mut self, site: &VariantSite) -> PgenResult<AddOutcome> {
        let limit = admission_limit(&self.config);
        if site.allele_count() > limit {
            self.counters.dropped_variants += 1;
            if self.config.log_drops {
                log::info!(
                    "Dropping variant at {} with {} alleles (max {})",
                    site.locus(),
                    site.allele_count(),
                    limit
                );
            }
            if let Some(drop_log) = self.drop_log.as_mut() {
                drop_log.record(&DropEvent::variant(site, limit))?;
            }
            return Ok(AddOutcome::Dropped {
                allele_count: site.allele_count(),
            });
        }

        let allele_map = AlleleCodeMap::build(site)?;
        let degraded = self.encode(site, &allele_map)?;

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| PgenError::Engine("storage engine is not open".to_string()))?;
        engine.append(
            self.packer.alleles().as_slice(),
            self.packer.phases().as_slice(),
            allele_map.allele_count(),
        )?;

        // only sites the engine accepted go to the .pvar
        if let Some(site_writer) = self.site_writer.as_mut() {
            site_writer.add(site)?;
        }

        self.counters.dropped_samples += degraded.len() as u64;
        for (sample, ploidy) in &degraded {
            if self.config.log_drops {
                log::info!(
                    "Sample {} with ploidy {} at {} recoded as no-call",
                    sample,
                    ploidy,
                    site.locus()
                );
            }
            if let Some(drop_log) = self.drop_log.as_mut() {
                drop_log.record(&DropEvent::sample(site, sample, *ploidy))?;
            }
        }

        Ok(AddOutcome::Written {
            degraded_samples: degraded.len() as u64,
        })
    }

    /// Fill both buffers in sample-registry order.
    ///
    /// The buffers are reset first, so an error here never leaks into the next
    /// variant. Every genotype of the site is appended exactly once: the first
    /// call for each registered sample in registry order, then all the others,
    /// which overflow. Returns the (sample, ploidy) pairs degraded to no-call.
    fn encode(
        &mut self,
        site: &VariantSite,
        allele_map: &AlleleCodeMap,
    ) -> PgenResult<Vec<(String, usize)>> {
        let PgenWriter {
            samples,
            packer,
            config,
            ..
        } = self;
        packer.reset();

        let mut chosen: HashMap<&str, usize> = HashMap::with_capacity(site.genotypes.len());
        for (index, call) in site.genotypes.iter().enumerate() {
            if samples.contains(&call.sample) {
                chosen.entry(call.sample.as_str()).or_insert(index);
            }
        }

        let mut degraded = Vec::new();
        for sample in samples.iter() {
            let call = chosen.get(sample).map(|&index| &site.genotypes[index]);
            let normalized = normalize_call(
                sample,
                call,
                site,
                allele_map,
                config.chromosome_scheme,
                config.ploidy_policy,
            )?;
            if normalized.degraded {
                degraded.push((sample.to_string(), call.map(|c| c.ploidy()).unwrap_or(0)));
            }
            packer.pack(sample, &normalized.packed, site)?;
        }

        // surplus calls (unregistered samples, repeats) are packed as-is so the
        // buffer overflow reports them
        for (index, call) in site.genotypes.iter().enumerate() {
            if chosen.get(call.sample.as_str()) != Some(&index) {
                packer.pack(&call.sample, &surplus_call(call, allele_map), site)?;
            }
        }

        packer.finish(site)?;
        Ok(degraded)
    }

    /// Number of variants dropped for exceeding the allele threshold
    pub fn dropped_variant_count(&self) -> u64 {
        self.counters.dropped_variants
    }

    /// Number of sample calls recoded as no-call under the lenient ploidy policy
    pub fn dropped_sample_count(&self) -> u64 {
        self.counters.dropped_samples
    }

    pub fn counters(&self) -> DropCounters {
        self.counters
    }

    /// Number of variants the engine reports as actually written
    pub fn written_variant_count(&self) -> u64 {
        self.engine.as_ref().map(|e| e.written_count()).unwrap_or(0)
    }

    pub fn samples(&self) -> &SampleRegistry {
        &self.samples
    }

    pub fn files(&self) -> &PgenFileSet {
        &self.files
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Finish the file set.
    ///
    /// Closes the `.pvar`, then the drop-event log, then finalises the engine,
    /// passing the dropped-variant count so a declared count that is short by
    /// exactly that many is accepted. Fails with [`PgenError::EmptyOutput`] when
    /// no variant was written, whatever the declared count.
    pub fn close(mut self) -> PgenResult<CloseSummary> {
        let sites_written = match self.site_writer.take() {
            Some(site_writer) => site_writer.close()?,
            None => 0,
        };
        if let Some(drop_log) = self.drop_log.take() {
            drop_log.close()?;
        }

        let engine = self
            .engine
            .take()
            .ok_or_else(|| PgenError::Engine("storage engine is not open".to_string()))?;
        let written_variants = engine.written_count();
        if written_variants == 0 {
            engine.abandon()?;
            return Err(PgenError::EmptyOutput(
                self.files.pgen.to_string_lossy().to_string(),
            ));
        }
        engine.close(self.counters.dropped_variants)?;

        log::info!(
            "Closed PGEN writer for {:?}: {} written, {} dropped variants, {} dropped samples",
            self.files.pgen,
            written_variants,
            self.counters.dropped_variants,
            self.counters.dropped_samples
        );

        Ok(CloseSummary {
            written_variants,
            dropped_variants: self.counters.dropped_variants,
            dropped_samples: self.counters.dropped_samples,
            sites_written,
        })
    }
}

impl Drop for PgenWriter {
    fn drop(&mut self) {
        if self.engine.is_some() {
            log::warn!(
                "PGEN writer for {:?} dropped without close; output is incomplete",
                self.files.pgen
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{MemoryEngineFactory, RawFileEngineFactory},
        Allele, ChromosomeScheme, PloidyPolicy, WriteFlags, WriteMode,
    };
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn header(samples: &[&str]) -> VcfHeader {
        VcfHeader::new(
            vec!["##fileformat=VCFv4.2".to_string()],
            samples.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn gt(sample: &str, alleles: &[&str], phased: bool) -> GenotypeCall {
        let alleles = alleles
            .iter()
            .map(|a| if *a == "." { Allele::NoCall } else { Allele::called(*a) })
            .collect();
        GenotypeCall::new(sample, alleles, phased)
    }

    fn site(chrom: &str, pos: u32, alleles: &[&str], genotypes: Vec<GenotypeCall>) -> VariantSite {
        VariantSite::new(chrom, pos, alleles.iter().map(|a| a.to_string()).collect())
            .with_genotypes(genotypes)
    }

    fn multi_allelic() -> WriterConfig {
        WriterConfig {
            write_flags: WriteFlags {
                preserve_phasing: true,
                multi_allelic: true,
            },
            ..WriterConfig::default()
        }
    }

    fn open(
        dir: &TempDir,
        samples: &[&str],
        config: WriterConfig,
        factory: &MemoryEngineFactory,
    ) -> PgenWriter {
        let path = dir.path().join("test.pgen");
        PgenWriter::create(path.to_str().unwrap(), &header(samples), config, factory).unwrap()
    }

    fn open_raw(path: &std::path::Path, samples: &[&str], config: WriterConfig) -> PgenWriter {
        let path = path.to_str().unwrap();
        PgenWriter::create(path, &header(samples), config, &RawFileEngineFactory).unwrap()
    }

    #[test]
    fn test_validate_writer_config() {
        assert!(validate_writer_config(&WriterConfig::default()).is_ok());

        let config = WriterConfig {
            max_alt_alleles: MAX_ALT_ALLELES + 1,
            ..WriterConfig::default()
        };
        let err = validate_writer_config(&config).unwrap_err();
        assert!(err.to_string().contains("exceeds the supported pgen max"));

        let config = WriterConfig {
            write_mode: WriteMode::BackwardSeek,
            variant_count: VariantCount::Unknown,
            ..WriterConfig::default()
        };
        assert!(matches!(
            validate_writer_config(&config),
            Err(PgenError::Configuration(_))
        ));

        let config = WriterConfig {
            write_mode: WriteMode::BackwardSeek,
            variant_count: VariantCount::Known(10),
            ..WriterConfig::default()
        };
        assert!(validate_writer_config(&config).is_ok());
    }

    #[test]
    fn test_create_rejects_bad_paths() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();

        let vcf_path = dir.path().join("test.vcf");
        let err = PgenWriter::create(
            vcf_path.to_str().unwrap(),
            &header(&["s1"]),
            WriterConfig::default(),
            &factory,
        )
        .err()
        .unwrap();
        assert!(matches!(err, PgenError::Configuration(_)));

        let err = PgenWriter::create(
            "gs://bucket/test.pgen",
            &header(&["s1"]),
            WriterConfig::default(),
            &factory,
        )
        .err()
        .unwrap();
        assert!(matches!(err, PgenError::Configuration(_)));
        assert!(factory.store().lock().unwrap().opened.is_none());
    }

    #[test]
    fn test_create_writes_companions() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let writer = open(&dir, &["s2", "s1"], WriterConfig::default(), &factory);

        let psam = fs::read_to_string(&writer.files().psam).unwrap();
        assert_eq!(psam, "#IID\tSEX\ns2\tN/A\ns1\tN/A\n");
        assert!(writer.files().pvar.exists());
        assert!(!writer.files().drop_log.exists());
        assert_eq!(factory.store().lock().unwrap().opened.unwrap().write_mode, 1);
    }

    #[test]
    fn test_admission_drop() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let config = WriterConfig {
            max_alt_alleles: 3,
            ..multi_allelic()
        };
        let mut writer = open(&dir, &["s1"], config, &factory);

        let wide = site("chr1", 10, &["A", "C", "G", "T"], vec![gt("s1", &["A", "T"], false)]);
        let outcome = writer.add(&wide).unwrap();
        assert_eq!(outcome, AddOutcome::Dropped { allele_count: 4 });
        assert_eq!(writer.dropped_variant_count(), 1);
        assert_eq!(writer.written_variant_count(), 0);

        let ok = site("chr1", 11, &["A", "C", "G"], vec![gt("s1", &["A", "G"], false)]);
        assert_eq!(writer.add(&ok).unwrap(), AddOutcome::Written { degraded_samples: 0 });
        assert_eq!(writer.written_variant_count(), 1);

        let pvar = writer.files().pvar.clone();
        let summary = writer.close().unwrap();
        assert_eq!(summary.dropped_variants, 1);
        assert_eq!(summary.sites_written, 1);

        let content = fs::read_to_string(pvar).unwrap();
        assert!(!content.contains("chr1\t10\t"));
        assert!(content.contains("chr1\t11\t"));
        assert_eq!(factory.store().lock().unwrap().closed_with, Some(1));
    }

    #[test]
    fn test_registry_order_and_absent_samples() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1", "s2", "s3"], WriterConfig::default(), &factory);

        // genotypes out of order, s2 missing
        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![gt("s3", &["C", "C"], true), gt("s1", &["A", "C"], false)],
        );
        writer.add(&v).unwrap();
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        let recorded = &store.variants[0];
        assert_eq!(recorded.alleles, vec![0, 1, NO_CALL_CODE, NO_CALL_CODE, 1, 1]);
        assert_eq!(recorded.phases, vec![0, 0, 1]);
        assert_eq!(recorded.allele_count, 2);
    }

    #[test]
    fn test_allele_count_excludes_no_call() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1"], multi_allelic(), &factory);

        writer
            .add(&site("chr2", 5, &["A", "C", "G"], vec![gt("s1", &[".", "G"], false)]))
            .unwrap();
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants[0].allele_count, 3);
        assert_eq!(store.variants[0].alleles, vec![NO_CALL_CODE, 2]);
    }

    #[test]
    fn test_haploid_sex_chromosome_is_homozygous() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["male"], WriterConfig::default(), &factory);

        writer
            .add(&site("chrX", 5000, &["G", "T"], vec![gt("male", &["T"], false)]))
            .unwrap();
        writer
            .add(&site("chrY", 6000, &["G", "T"], vec![gt("male", &["G"], false)]))
            .unwrap();
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants[0].alleles, vec![1, 1]);
        assert_eq!(store.variants[1].alleles, vec![0, 0]);
    }

    #[test]
    fn test_haploid_phase_flag_plain_scheme() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let config = WriterConfig {
            chromosome_scheme: ChromosomeScheme::Plain,
            ..WriterConfig::default()
        };
        let mut writer = open(&dir, &["phased", "unphased"], config, &factory);

        for chrom in ["X", "Y"] {
            let v = site(
                chrom,
                300,
                &["G", "T"],
                vec![gt("phased", &["T"], true), gt("unphased", &["G"], false)],
            );
            writer.add(&v).unwrap();
        }
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        for recorded in &store.variants {
            assert_eq!(recorded.alleles, vec![1, 1, 0, 0]);
            // one flag per sample, not one per expanded allele
            assert_eq!(recorded.phases, vec![1, 0]);
        }
    }

    #[test]
    fn test_lenient_ploidy_degrades_sample() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let config = WriterConfig {
            ploidy_policy: PloidyPolicy::Lenient,
            log_drops: true,
            ..WriterConfig::default()
        };
        let mut writer = open(&dir, &["s1", "s2"], config, &factory);

        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![gt("s1", &["A", "C", "C"], false), gt("s2", &["A", "A"], false)],
        );
        assert_eq!(writer.add(&v).unwrap(), AddOutcome::Written { degraded_samples: 1 });
        assert_eq!(writer.dropped_sample_count(), 1);
        assert_eq!(writer.written_variant_count(), 1);

        let drop_log = writer.files().drop_log.clone();
        let summary = writer.close().unwrap();
        assert_eq!(summary.dropped_samples, 1);
        assert_eq!(summary.sites_written, 1);

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants[0].alleles, vec![NO_CALL_CODE, NO_CALL_CODE, 0, 0]);

        let log = fs::read_to_string(drop_log).unwrap();
        assert!(log.contains("sample\tchr1\t100\ts1\tploidy 3 recoded as no-call"));
    }

    #[test]
    fn test_strict_ploidy_error_is_recoverable() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1", "s2"], WriterConfig::default(), &factory);

        let bad = site(
            "chr1",
            100,
            &["A", "C"],
            vec![gt("s1", &["C", "C"], false), gt("s2", &["A", "C", "C"], false)],
        );
        let err = writer.add(&bad).unwrap_err();
        assert!(matches!(err, PgenError::Ploidy { ploidy: 3, ref sample, .. } if sample == "s2"));
        assert_eq!(writer.written_variant_count(), 0);

        let good = site(
            "chr1",
            101,
            &["A", "C"],
            vec![gt("s1", &["A", "A"], false), gt("s2", &["A", "C"], false)],
        );
        writer.add(&good).unwrap();
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants.len(), 1);
        assert_eq!(store.variants[0].alleles, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_sample_count_mismatch_overflows() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);

        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![
                gt("s1", &["A", "C"], false),
                gt("s2", &["A", "C"], false),
                gt("s3", &["C", "C"], false),
            ],
        );
        match writer.add(&v) {
            Err(PgenError::Overflow {
                position,
                capacity,
                sample,
                allele,
                locus,
            }) => {
                assert_eq!(position, 2);
                assert_eq!(capacity, 2);
                assert_eq!(sample, "s2");
                assert_eq!(allele, "0");
                assert!(locus.contains("chr1:100"));
            }
            other => panic!("expected overflow, got {:?}", other.map(|_| ())),
        }

        // fatal: the writer refuses further work
        let next = site("chr1", 101, &["A", "C"], vec![gt("s1", &["A", "C"], false)]);
        assert!(matches!(writer.add(&next), Err(PgenError::WriterFailed(_))));
    }

    #[test]
    fn test_repeated_sample_overflows() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);

        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![
                gt("s1", &["A", "C"], false),
                gt("s1", &["C", "C"], false),
                gt("s1", &["A", "A"], false),
            ],
        );
        match writer.add(&v) {
            Err(PgenError::Overflow {
                position,
                sample,
                allele,
                ..
            }) => {
                assert_eq!(position, 2);
                assert_eq!(sample, "s1");
                assert_eq!(allele, "1");
            }
            other => panic!("expected overflow, got {:?}", other.map(|_| ())),
        }
        assert_eq!(writer.written_variant_count(), 0);
        assert!(matches!(writer.add(&v), Err(PgenError::WriterFailed(_))));
    }

    #[test]
    fn test_unregistered_sample_overflows_before_normalizing() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);

        // triploid call for a sample the writer does not know
        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![gt("s1", &["A", "C"], false), gt("s2", &["A", "C", "C"], false)],
        );
        let err = writer.add(&v).unwrap_err();
        assert!(matches!(err, PgenError::Overflow { ref sample, .. } if sample == "s2"));
        assert!(!err.is_recoverable());

        let next = site("chr1", 101, &["A", "C"], vec![gt("s1", &["A", "C"], false)]);
        assert!(matches!(writer.add(&next), Err(PgenError::WriterFailed(_))));

        // an allele outside the site is reported as a no-call code, not an encoding error
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);
        let v = site(
            "chr1",
            100,
            &["A", "C"],
            vec![gt("s2", &["T", "T"], false), gt("s1", &["A", "C"], false)],
        );
        match writer.add(&v) {
            Err(PgenError::Overflow { sample, allele, .. }) => {
                assert_eq!(sample, "s2");
                assert_eq!(allele, NO_CALL_CODE.to_string());
            }
            other => panic!("expected overflow, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_multi_allelic_dropped_without_flag() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        assert_eq!(admission_limit(&WriterConfig::default()), 2);
        assert_eq!(admission_limit(&multi_allelic()), MAX_ALT_ALLELES);

        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);
        let triallelic = site("chr1", 10, &["A", "C", "G"], vec![gt("s1", &["A", "G"], false)]);
        assert_eq!(
            writer.add(&triallelic).unwrap(),
            AddOutcome::Dropped { allele_count: 3 }
        );

        let biallelic = site("chr1", 11, &["A", "C"], vec![gt("s1", &["A", "C"], false)]);
        assert_eq!(
            writer.add(&biallelic).unwrap(),
            AddOutcome::Written { degraded_samples: 0 }
        );

        let summary = writer.close().unwrap();
        assert_eq!(summary.written_variants, 1);
        assert_eq!(summary.dropped_variants, 1);
        assert_eq!(factory.store().lock().unwrap().closed_with, Some(1));
    }

    #[test]
    fn test_duplicate_site_allele_is_recoverable() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);

        let bad = site("chr1", 10, &["A", "A"], vec![gt("s1", &["A", "A"], false)]);
        let err = writer.add(&bad).unwrap_err();
        assert!(matches!(err, PgenError::InvalidVariant(_)));

        let good = site("chr1", 11, &["A", "C"], vec![gt("s1", &["A", "C"], false)]);
        writer.add(&good).unwrap();
        assert_eq!(writer.close().unwrap().written_variants, 1);
    }

    #[test]
    fn test_close_without_writes_is_empty_output() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let config = WriterConfig {
            write_mode: WriteMode::WriteAndCopy,
            variant_count: VariantCount::Known(6),
            ..WriterConfig::default()
        };
        let writer = open(&dir, &["s1", "s2", "s3"], config, &factory);
        assert!(matches!(writer.close(), Err(PgenError::EmptyOutput(_))));

        let writer = open(&dir, &["s1"], WriterConfig::default(), &factory);
        assert!(matches!(writer.close(), Err(PgenError::EmptyOutput(_))));
        assert!(factory.store().lock().unwrap().abandoned);
    }

    #[test]
    fn test_empty_output_removes_partial_files() {
        for mode in [WriteMode::BackwardSeek, WriteMode::SeparateIndex] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("empty.pgen");
            let config = WriterConfig {
                write_mode: mode,
                variant_count: VariantCount::Known(1),
                max_alt_alleles: 1,
                ..WriterConfig::default()
            };
            let mut writer = open_raw(&path, &["s1"], config);
            let index = writer.files().index.clone();
            assert!(path.exists());

            let v = site("chr1", 1, &["A", "C"], vec![gt("s1", &["A", "C"], false)]);
            assert_eq!(writer.add(&v).unwrap(), AddOutcome::Dropped { allele_count: 2 });
            assert!(matches!(writer.close(), Err(PgenError::EmptyOutput(_))));
            assert!(!path.exists());
            assert!(!index.exists());
        }
    }

    #[test]
    fn test_close_reconciles_declared_count() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let config = WriterConfig {
            variant_count: VariantCount::Known(3),
            max_alt_alleles: 2,
            ..WriterConfig::default()
        };
        let mut writer = open(&dir, &["s1"], config.clone(), &factory);
        writer
            .add(&site("chr1", 1, &["A", "C"], vec![gt("s1", &["A", "C"], false)]))
            .unwrap();
        writer
            .add(&site("chr1", 2, &["A", "C", "G"], vec![gt("s1", &["A", "G"], false)]))
            .unwrap();
        // one written + one dropped, declared three
        let err = writer.close().unwrap_err();
        assert!(matches!(err, PgenError::Engine(_)));

        let config = WriterConfig {
            variant_count: VariantCount::Known(2),
            ..config
        };
        let mut writer = open(&dir, &["s1"], config, &factory);
        writer
            .add(&site("chr1", 1, &["A", "C"], vec![gt("s1", &["A", "C"], false)]))
            .unwrap();
        writer
            .add(&site("chr1", 2, &["A", "C", "G"], vec![gt("s1", &["A", "G"], false)]))
            .unwrap();
        let summary = writer.close().unwrap();
        assert_eq!(summary.written_variants, 1);
        assert_eq!(summary.dropped_variants, 1);
    }

    #[test]
    fn test_engine_failure_is_not_forwarded() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::failing_append_at(1);
        let mut writer = open(&dir, &["s1"], WriterConfig::default(), &factory);

        writer
            .add(&site("chr1", 1, &["A", "C"], vec![gt("s1", &["A", "C"], false)]))
            .unwrap();
        let err = writer
            .add(&site("chr1", 2, &["A", "C"], vec![gt("s1", &["A", "C"], false)]))
            .unwrap_err();
        assert!(matches!(err, PgenError::Engine(_)));
        assert!(matches!(
            writer.add(&site("chr1", 3, &["A", "C"], vec![])),
            Err(PgenError::WriterFailed(_))
        ));

        let pvar = writer.files().pvar.clone();
        let summary = writer.close().unwrap();
        assert_eq!(summary.written_variants, 1);
        assert_eq!(summary.sites_written, 1);
        let content = fs::read_to_string(pvar).unwrap();
        assert!(content.contains("chr1\t1\t"));
        assert!(!content.contains("chr1\t2\t"));
    }

    #[test]
    fn test_encoding_is_idempotent() {
        let dir = tempdir().unwrap();
        let factory = MemoryEngineFactory::new();
        let mut writer = open(&dir, &["s1", "s2"], multi_allelic(), &factory);

        let v = site(
            "chrX",
            77,
            &["A", "C", "G"],
            vec![gt("s2", &["G"], false), gt("s1", &["C", "G"], true)],
        );
        writer.add(&v).unwrap();
        writer.add(&v).unwrap();
        writer.close().unwrap();

        let store = factory.store();
        let store = store.lock().unwrap();
        assert_eq!(store.variants[0], store.variants[1]);
        assert_eq!(store.variants[0].alleles, vec![1, 2, 2, 2]);
        assert_eq!(store.variants[0].phases, vec![1, 0]);
    }

    #[test]
    fn test_raw_file_engine_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cohort.pgen");
        let config = WriterConfig {
            write_mode: WriteMode::BackwardSeek,
            variant_count: VariantCount::Known(1),
            ..WriterConfig::default()
        };
        let mut writer = open_raw(&path, &["s1"], config);
        writer
            .add(&site("chr1", 1, &["A", "C"], vec![gt("s1", &["C", "A"], false)]))
            .unwrap();
        let summary = writer.close().unwrap();
        assert_eq!(summary.written_variants, 1);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
        assert!(dir.path().join("cohort.pvar").exists());
        assert!(dir.path().join("cohort.psam").exists());
    }
}
