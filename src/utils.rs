//! Utility functions for file handling and common operations

use crate::{PgenError, PgenResult};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Check if a file is gzip compressed
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> PgenResult<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0; 2];

    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(PgenError::Io(e)),
    }
}

/// Validate file paths and check if they exist
pub fn validate_file_exists<P: AsRef<Path>>(path: P) -> PgenResult<()> {
    if !path.as_ref().exists() {
        return Err(PgenError::FileNotFound(
            path.as_ref().to_string_lossy().to_string(),
        ));
    }
    Ok(())
}

/// Validate that a file is readable
pub fn validate_file_readable<P: AsRef<Path>>(path: P) -> PgenResult<()> {
    validate_file_exists(&path)?;

    File::open(&path)
        .map_err(|_| PgenError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    Ok(())
}

/// Check if a path has a specific extension
pub fn has_extension<P: AsRef<Path>>(path: P, extension: &str) -> bool {
    path.as_ref()
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Resolve a user-supplied output location to a local path.
///
/// Plain paths and `file://` URIs are accepted; any other URI scheme is rejected.
pub fn local_path(raw: &str) -> PgenResult<PathBuf> {
    match raw.split_once("://") {
        None => Ok(PathBuf::from(raw)),
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("file") => Ok(PathBuf::from(rest)),
        Some((scheme, _)) => Err(PgenError::Configuration(format!(
            "Invalid pgen file name: {}. pgen files must be local files (got scheme '{}')",
            raw, scheme
        ))),
    }
}

/// Path with its final extension replaced by `suffix` (which includes the dot)
pub fn sibling_with_suffix<P: AsRef<Path>>(path: P, suffix: &str) -> PathBuf {
    let stem = path.as_ref().with_extension("");
    let mut name = stem.into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Format a file size in bytes to a human-readable string
pub fn format_file_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Create parent directories if they don't exist
pub fn ensure_parent_dirs<P: AsRef<Path>>(path: P) -> PgenResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Timer utility for measuring execution time
pub struct Timer {
    start: std::time::Instant,
    name: String,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        log::info!("Starting timer: {}", name);
        Timer {
            start: std::time::Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn log_elapsed(&self) {
        let duration = self.elapsed();
        log::info!("Timer '{}' elapsed: {:.2?}", self.name, duration);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.log_elapsed();
    }
}
