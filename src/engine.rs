//! Boundary with the external PGEN storage engine.
//!
//! The writer never talks to a concrete engine directly: it is handed an
//! [`EngineFactory`] at construction, opens exactly one [`StorageEngine`] through
//! it and owns that handle until close. Typed write modes and flags are turned
//! into the engine's integer codes in one place, [`engine_codes`].
//!
//! Two reference engines are provided. [`MemoryEngine`] keeps every appended
//! variant in memory for inspection; [`RawFileEngine`] dumps the packed buffers
//! to disk as-is and is meant for debugging, not for plink2 consumption.

use crate::{companion::PgenFileSet, PgenError, PgenResult};
use clap::ValueEnum;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Variant count passed to the engine when the caller cannot provide one
pub const VARIANT_COUNT_UNKNOWN: u32 = 0x7fff_fffd;

pub const WRITE_FLAG_PRESERVE_PHASING: u32 = 0x1;
pub const WRITE_FLAG_MULTI_ALLELIC: u32 = 0x2;

/// Strategy the engine uses to lay out its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WriteMode {
    /// Single pass, seeking back to patch the header; needs an exact variant count
    BackwardSeek,
    /// Variant index written to a separate `.pgi` file
    SeparateIndex,
    /// Write to a temporary file, then move it into place on close
    WriteAndCopy,
}

impl WriteMode {
    pub fn requires_known_count(&self) -> bool {
        matches!(self, WriteMode::BackwardSeek)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    pub preserve_phasing: bool,
    pub multi_allelic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantCount {
    Known(u64),
    Unknown,
}

/// Everything the engine needs to open a new output
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub path: PathBuf,
    pub write_mode: WriteMode,
    pub write_flags: WriteFlags,
    pub variant_count: VariantCount,
    pub sample_count: usize,
    pub max_alt_alleles: usize,
}

/// Native integer encoding of the open parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCodes {
    pub write_mode: u32,
    pub write_flags: u32,
    pub variant_count: u32,
}

pub fn engine_codes(params: &OpenParams) -> EngineCodes {
    let write_mode = match params.write_mode {
        WriteMode::BackwardSeek => 0,
        WriteMode::SeparateIndex => 1,
        WriteMode::WriteAndCopy => 2,
    };

    let mut write_flags = 0;
    if params.write_flags.preserve_phasing {
        write_flags |= WRITE_FLAG_PRESERVE_PHASING;
    }
    if params.write_flags.multi_allelic {
        write_flags |= WRITE_FLAG_MULTI_ALLELIC;
    }

    let variant_count = match params.variant_count {
        VariantCount::Known(n) => u32::try_from(n)
            .ok()
            .filter(|n| *n < VARIANT_COUNT_UNKNOWN)
            .unwrap_or(VARIANT_COUNT_UNKNOWN),
        VariantCount::Unknown => VARIANT_COUNT_UNKNOWN,
    };

    EngineCodes {
        write_mode,
        write_flags,
        variant_count,
    }
}

/// An open engine output. Exclusively owned by one writer.
pub trait StorageEngine {
    /// Persist one variant. `allele_count` excludes the no-call code.
    fn append(&mut self, alleles: &[i32], phases: &[u8], allele_count: usize) -> PgenResult<()>;

    /// Number of variants actually persisted so far
    fn written_count(&self) -> u64;

    /// Finalise the output, tolerating a shortfall of `dropped_variants`
    fn close(self: Box<Self>, dropped_variants: u64) -> PgenResult<()>;

    /// Give up on the output without finalising it, removing anything partial
    fn abandon(self: Box<Self>) -> PgenResult<()>;
}

/// Opens engine outputs; injected into the writer at construction
pub trait EngineFactory {
    fn open(&self, params: &OpenParams) -> PgenResult<Box<dyn StorageEngine>>;
}

/// Checks shared by every engine before it accepts a variant
fn check_append(
    params: &OpenParams,
    alleles: &[i32],
    phases: &[u8],
    allele_count: usize,
) -> PgenResult<()> {
    if alleles.len() != params.sample_count * 2 || phases.len() != params.sample_count {
        return Err(PgenError::Engine(format!(
            "Expected {} allele codes and {} phase flags, got {} and {}",
            params.sample_count * 2,
            params.sample_count,
            alleles.len(),
            phases.len()
        )));
    }
    if allele_count > params.max_alt_alleles + 1 {
        return Err(PgenError::Engine(format!(
            "Allele count {} exceeds the configured max of {} alternate alleles",
            allele_count, params.max_alt_alleles
        )));
    }
    if allele_count > 2 && !params.write_flags.multi_allelic {
        return Err(PgenError::Engine(format!(
            "Variant with {} alleles requires the multi-allelic write flag",
            allele_count
        )));
    }
    Ok(())
}

/// Declared vs. actual variant count check performed at close
pub fn reconcile_variant_count(
    declared: VariantCount,
    written: u64,
    dropped: u64,
) -> PgenResult<()> {
    if let VariantCount::Known(declared) = declared {
        if written + dropped != declared {
            return Err(PgenError::Engine(format!(
                "Number of written variants ({}) plus dropped variants ({}) not equal to initially declared value ({})",
                written, dropped, declared
            )));
        }
    }
    Ok(())
}

/// A variant as received by [`MemoryEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVariant {
    pub alleles: Vec<i32>,
    pub phases: Vec<u8>,
    pub allele_count: usize,
}

/// Shared view of everything a [`MemoryEngine`] received
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub opened: Option<EngineCodes>,
    pub variants: Vec<RecordedVariant>,
    /// Dropped count passed to a successful close
    pub closed_with: Option<u64>,
    pub abandoned: bool,
}

/// Factory for in-memory engines; clones share the same store
#[derive(Debug, Clone, Default)]
pub struct MemoryEngineFactory {
    store: Arc<Mutex<MemoryStore>>,
    fail_append_at: Option<u64>,
}

impl MemoryEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines from this factory fail the append of the `n`th variant (0-based)
    pub fn failing_append_at(n: u64) -> Self {
        Self {
            store: Arc::default(),
            fail_append_at: Some(n),
        }
    }

    pub fn store(&self) -> Arc<Mutex<MemoryStore>> {
        Arc::clone(&self.store)
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn open(&self, params: &OpenParams) -> PgenResult<Box<dyn StorageEngine>> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| PgenError::Engine("memory store lock poisoned".to_string()))?;
        store.opened = Some(engine_codes(params));
        store.variants.clear();
        store.closed_with = None;
        store.abandoned = false;
        Ok(Box::new(MemoryEngine {
            params: params.clone(),
            store: Arc::clone(&self.store),
            fail_append_at: self.fail_append_at,
            attempts: 0,
            written: 0,
        }))
    }
}

pub struct MemoryEngine {
    params: OpenParams,
    store: Arc<Mutex<MemoryStore>>,
    fail_append_at: Option<u64>,
    attempts: u64,
    written: u64,
}

impl MemoryEngine {
    fn lock(&self) -> PgenResult<std::sync::MutexGuard<'_, MemoryStore>> {
        self.store
            .lock()
            .map_err(|_| PgenError::Engine("memory store lock poisoned".to_string()))
    }
}

impl StorageEngine for MemoryEngine {
    fn append(&mut self, alleles: &[i32], phases: &[u8], allele_count: usize) -> PgenResult<()> {
        let attempt = self.attempts;
        self.attempts += 1;
        if self.fail_append_at == Some(attempt) {
            return Err(PgenError::Engine(format!(
                "Injected append failure at variant {}",
                attempt
            )));
        }
        check_append(&self.params, alleles, phases, allele_count)?;
        self.lock()?.variants.push(RecordedVariant {
            alleles: alleles.to_vec(),
            phases: phases.to_vec(),
            allele_count,
        });
        self.written += 1;
        Ok(())
    }

    fn written_count(&self) -> u64 {
        self.written
    }

    fn close(self: Box<Self>, dropped_variants: u64) -> PgenResult<()> {
        reconcile_variant_count(self.params.variant_count, self.written, dropped_variants)?;
        self.lock()?.closed_with = Some(dropped_variants);
        Ok(())
    }

    fn abandon(self: Box<Self>) -> PgenResult<()> {
        self.lock()?.abandoned = true;
        Ok(())
    }
}

const RAW_MAGIC: &[u8; 4] = b"PGRW";
const RAW_VERSION: u8 = 1;
const RAW_COUNT_OFFSET: u64 = 12;

/// Opens [`RawFileEngine`] outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileEngineFactory;

impl EngineFactory for RawFileEngineFactory {
    fn open(&self, params: &OpenParams) -> PgenResult<Box<dyn StorageEngine>> {
        Ok(Box::new(RawFileEngine::create(params)?))
    }
}

/// Writes packed buffers verbatim.
///
/// Layout: 16-byte header (`PGRW`, version, mode, flags, reserved, sample count
/// u32, variant count u32), then per variant the allele count (u32), the allele
/// codes (i32) and, when phasing is preserved, one phase byte per sample. All
/// integers are little-endian.
pub struct RawFileEngine {
    params: OpenParams,
    codes: EngineCodes,
    target: PathBuf,
    write_path: PathBuf,
    out: BufWriter<File>,
    index_path: Option<PathBuf>,
    index: Option<BufWriter<File>>,
    offset: u64,
    written: u64,
    finished: bool,
}

impl RawFileEngine {
    pub fn create(params: &OpenParams) -> PgenResult<Self> {
        let codes = engine_codes(params);
        let target = params.path.clone();
        let write_path = match params.write_mode {
            WriteMode::WriteAndCopy => temp_path(&target),
            _ => target.clone(),
        };

        let file = File::create(&write_path).map_err(|e| {
            PgenError::Engine(format!("Failed to open {}: {}", write_path.display(), e))
        })?;
        let mut out = BufWriter::new(file);

        let sample_count = u32::try_from(params.sample_count).map_err(|_| {
            PgenError::Engine(format!("Sample count {} is too large", params.sample_count))
        })?;
        out.write_all(RAW_MAGIC)?;
        out.write_all(&[RAW_VERSION, codes.write_mode as u8, codes.write_flags as u8, 0])?;
        out.write_all(&sample_count.to_le_bytes())?;
        out.write_all(&codes.variant_count.to_le_bytes())?;

        let index_path = match params.write_mode {
            WriteMode::SeparateIndex => Some(PgenFileSet::from_pgen(&target).index),
            _ => None,
        };
        let index = match &index_path {
            Some(index_path) => {
                let file = File::create(index_path).map_err(|e| {
                    PgenError::Engine(format!("Failed to open {}: {}", index_path.display(), e))
                })?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        log::debug!("Opened raw engine output {:?} (mode {:?})", write_path, params.write_mode);

        Ok(Self {
            params: params.clone(),
            codes,
            target,
            write_path,
            out,
            index_path,
            index,
            offset: RAW_COUNT_OFFSET + 4,
            written: 0,
            finished: false,
        })
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

impl StorageEngine for RawFileEngine {
    fn append(&mut self, alleles: &[i32], phases: &[u8], allele_count: usize) -> PgenResult<()> {
        check_append(&self.params, alleles, phases, allele_count)?;

        if let Some(index) = self.index.as_mut() {
            index.write_all(&self.offset.to_le_bytes())?;
        }

        self.out.write_all(&(allele_count as u32).to_le_bytes())?;
        for code in alleles {
            self.out.write_all(&code.to_le_bytes())?;
        }
        let mut record_len = 4 + alleles.len() as u64 * 4;
        if self.codes.write_flags & WRITE_FLAG_PRESERVE_PHASING != 0 {
            self.out.write_all(phases)?;
            record_len += phases.len() as u64;
        }

        self.offset += record_len;
        self.written += 1;
        Ok(())
    }

    fn written_count(&self) -> u64 {
        self.written
    }

    fn close(mut self: Box<Self>, dropped_variants: u64) -> PgenResult<()> {
        reconcile_variant_count(self.params.variant_count, self.written, dropped_variants)?;

        if self.params.write_mode == WriteMode::BackwardSeek {
            let written = u32::try_from(self.written)
                .map_err(|_| PgenError::Engine(format!("Too many variants: {}", self.written)))?;
            self.out.seek(SeekFrom::Start(RAW_COUNT_OFFSET))?;
            self.out.write_all(&written.to_le_bytes())?;
        }
        self.out.flush()?;
        if let Some(index) = self.index.as_mut() {
            index.flush()?;
        }

        if self.write_path != self.target {
            fs::rename(&self.write_path, &self.target)?;
        }
        self.finished = true;
        log::debug!(
            "Closed raw engine output {:?} with {} variants",
            self.target,
            self.written
        );
        Ok(())
    }

    fn abandon(mut self: Box<Self>) -> PgenResult<()> {
        self.finished = true;
        let mut partial = vec![self.write_path.clone()];
        partial.extend(self.index_path.clone());
        // close the handles before unlinking
        drop(self);

        for path in partial {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed partial output {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for RawFileEngine {
    fn drop(&mut self) {
        // an abandoned write-and-copy output never reaches its final name
        if !self.finished && self.write_path != self.target {
            let _ = fs::remove_file(&self.write_path);
        }
    }
}
