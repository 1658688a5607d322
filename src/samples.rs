//! Canonical sample order shared by every encoded variant

use crate::{PgenError, PgenResult};
use std::collections::HashMap;

/// Sample identifiers in the order their genotypes are packed.
///
/// Captured once when the writer is built and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRegistry {
    samples: Vec<String>,
    positions: HashMap<String, usize>,
}

impl SampleRegistry {
    pub fn new(samples: Vec<String>) -> PgenResult<Self> {
        let mut positions = HashMap::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            if positions.insert(sample.clone(), index).is_some() {
                return Err(PgenError::Configuration(format!(
                    "Duplicate sample name in header: {}",
                    sample
                )));
            }
        }
        Ok(Self { samples, positions })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, sample: &str) -> bool {
        self.positions.contains_key(sample)
    }

    pub fn position(&self, sample: &str) -> Option<usize> {
        self.positions.get(sample).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(String::as_str)
    }
}
