//! Fixed-capacity allele-code and phase buffers, filled once per variant.
//!
//! Both buffers are owned by the writer and reused across variants. They must be
//! reset before every fill, and must be exactly full before being handed to the
//! storage engine.

use crate::{PgenError, PgenResult, VariantSite};

/// Append past the end of a fixed-capacity buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull {
    pub position: usize,
    pub capacity: usize,
}

/// Two 32-bit allele codes per sample
#[derive(Debug)]
pub struct AlleleBuffer {
    codes: Vec<i32>,
    capacity: usize,
}

impl AlleleBuffer {
    pub fn for_samples(sample_count: usize) -> Self {
        let capacity = sample_count * 2;
        Self {
            codes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn reset(&mut self) {
        self.codes.clear();
    }

    pub fn push(&mut self, code: i32) -> Result<(), BufferFull> {
        if self.codes.len() >= self.capacity {
            return Err(BufferFull {
                position: self.codes.len(),
                capacity: self.capacity,
            });
        }
        self.codes.push(code);
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.codes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.codes.len() == self.capacity
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.codes
    }

    /// Size of the filled buffer in bytes
    pub fn byte_len(&self) -> usize {
        self.codes.len() * std::mem::size_of::<i32>()
    }

    /// Little-endian serialisation of the filled codes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        for code in &self.codes {
            bytes.extend_from_slice(&code.to_le_bytes());
        }
        bytes
    }
}

/// One phase flag per sample (1 = phased)
#[derive(Debug)]
pub struct PhaseBuffer {
    flags: Vec<u8>,
    capacity: usize,
}

impl PhaseBuffer {
    pub fn for_samples(sample_count: usize) -> Self {
        Self {
            flags: Vec::with_capacity(sample_count),
            capacity: sample_count,
        }
    }

    pub fn reset(&mut self) {
        self.flags.clear();
    }

    pub fn push(&mut self, phased: bool) -> Result<(), BufferFull> {
        if self.flags.len() >= self.capacity {
            return Err(BufferFull {
                position: self.flags.len(),
                capacity: self.capacity,
            });
        }
        self.flags.push(u8::from(phased));
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.flags.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.flags.len() == self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.flags
    }
}

/// Pair of allele codes plus phase for one sample, ready to be packed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedCall {
    pub codes: [i32; 2],
    pub phased: bool,
}

/// Sequential, capacity-checked writer over both buffers
#[derive(Debug)]
pub struct GenotypePacker {
    alleles: AlleleBuffer,
    phases: PhaseBuffer,
}

impl GenotypePacker {
    pub fn for_samples(sample_count: usize) -> Self {
        Self {
            alleles: AlleleBuffer::for_samples(sample_count),
            phases: PhaseBuffer::for_samples(sample_count),
        }
    }

    pub fn reset(&mut self) {
        self.alleles.reset();
        self.phases.reset();
    }

    /// Append one sample's call; overflow is decorated with the sample and locus
    pub fn pack(&mut self, sample: &str, call: &PackedCall, site: &VariantSite) -> PgenResult<()> {
        for code in call.codes {
            self.alleles.push(code).map_err(|full| PgenError::Overflow {
                position: full.position,
                capacity: full.capacity,
                sample: sample.to_string(),
                allele: code.to_string(),
                locus: site.describe(),
            })?;
        }
        self.phases.push(call.phased).map_err(|full| PgenError::Overflow {
            position: full.position,
            capacity: full.capacity,
            sample: sample.to_string(),
            allele: "phase".to_string(),
            locus: site.describe(),
        })
    }

    /// Verify both buffers were filled exactly
    pub fn finish(&self, site: &VariantSite) -> PgenResult<()> {
        if !self.alleles.is_full() {
            return Err(PgenError::Encoding(format!(
                "Allele buffer is not completely filled at {}. Position: {} Expected: {}",
                site.locus(),
                self.alleles.position(),
                self.alleles.capacity()
            )));
        }
        if !self.phases.is_full() {
            return Err(PgenError::Encoding(format!(
                "Phase buffer is not completely filled at {}. Position: {} Expected: {}",
                site.locus(),
                self.phases.position(),
                self.phases.capacity()
            )));
        }
        Ok(())
    }

    pub fn alleles(&self) -> &AlleleBuffer {
        &self.alleles
    }

    pub fn phases(&self) -> &PhaseBuffer {
        &self.phases
    }
}
