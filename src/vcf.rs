//! VCF file reading: header capture and record parsing into [`VariantSite`]s

use crate::{utils::is_gzipped, Allele, GenotypeCall, PgenError, PgenResult, VariantSite};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Column indices for VCF parsing
#[derive(Debug, Clone)]
pub struct VcfColumnIndices {
    pub chrom: usize,
    pub pos: usize,
    pub id: usize,
    pub ref_allele: usize,
    pub alt: usize,
    pub qual: usize,
    pub filter: usize,
    pub info: usize,
    pub format: Option<usize>,
    pub samples_start: usize,
}

impl VcfColumnIndices {
    pub fn from_header(header_line: &str) -> PgenResult<Self> {
        let fields: Vec<&str> = header_line.trim().split('\t').collect();
        let find = |name: &str| {
            fields
                .iter()
                .position(|&col| col == name || col.trim_start_matches('#') == name)
                .ok_or_else(|| {
                    PgenError::InvalidVariant(format!("{} column not found in VCF header", name))
                })
        };

        let format = fields.iter().position(|&col| col == "FORMAT");
        Ok(VcfColumnIndices {
            chrom: find("CHROM")?,
            pos: find("POS")?,
            id: find("ID")?,
            ref_allele: find("REF")?,
            alt: find("ALT")?,
            qual: find("QUAL")?,
            filter: find("FILTER")?,
            info: find("INFO")?,
            format,
            samples_start: format.map(|f| f + 1).unwrap_or(fields.len()),
        })
    }

    /// Standard column order, used when a file has no `#CHROM` line
    pub fn standard(column_count: usize) -> Self {
        VcfColumnIndices {
            chrom: 0,
            pos: 1,
            id: 2,
            ref_allele: 3,
            alt: 4,
            qual: 5,
            filter: 6,
            info: 7,
            format: if column_count > 8 { Some(8) } else { None },
            samples_start: 9,
        }
    }
}

/// Header of a VCF file: `##` meta lines and the sample columns
#[derive(Debug, Clone, Default)]
pub struct VcfHeader {
    pub meta_lines: Vec<String>,
    pub samples: Vec<String>,
    pub columns: Option<VcfColumnIndices>,
}

impl VcfHeader {
    pub fn new(meta_lines: Vec<String>, samples: Vec<String>) -> Self {
        Self {
            meta_lines,
            samples,
            columns: None,
        }
    }

    fn parse_column_line(&mut self, line: &str) -> PgenResult<()> {
        let indices = VcfColumnIndices::from_header(line)?;
        let fields: Vec<&str> = line.trim().split('\t').collect();
        self.samples = if indices.format.is_some() {
            fields[indices.samples_start..].iter().map(|s| s.to_string()).collect()
        } else {
            Vec::new()
        };
        self.columns = Some(indices);
        Ok(())
    }
}

/// Parse a GT value (`0/1`, `1|0`, `./.`, `1`) against the site's allele list.
///
/// Returns `None` for a bare `.`, which carries no ploidy.
pub fn parse_genotype(
    sample: &str,
    gt: &str,
    alleles: &[String],
) -> PgenResult<Option<GenotypeCall>> {
    if gt.is_empty() || gt == "." {
        return Ok(None);
    }

    let phased = gt.contains('|');
    let mut calls = Vec::new();
    for token in gt.split(|c| c == '/' || c == '|') {
        if token == "." {
            calls.push(Allele::NoCall);
            continue;
        }
        let index = token.parse::<usize>().map_err(|_| {
            PgenError::InvalidVariant(format!("Invalid GT value '{}' for sample {}", gt, sample))
        })?;
        let bases = alleles.get(index).ok_or_else(|| {
            PgenError::InvalidVariant(format!(
                "GT allele index {} out of range for sample {} ({} alleles)",
                index,
                sample,
                alleles.len()
            ))
        })?;
        calls.push(Allele::Called(bases.clone()));
    }

    Ok(Some(GenotypeCall::new(sample, calls, phased)))
}

/// Parse one data line into a [`VariantSite`]
pub fn parse_record(
    line: &str,
    indices: &VcfColumnIndices,
    samples: &[String],
) -> PgenResult<VariantSite> {
    let fields: Vec<&str> = line.split('\t').collect();

    if fields.len() <= indices.info {
        return Err(PgenError::InvalidVariant(format!(
            "Invalid VCF line format - not enough columns: {}",
            line
        )));
    }

    let pos = fields[indices.pos].parse::<u32>().map_err(|_| {
        PgenError::InvalidVariant(format!("Invalid position: {}", fields[indices.pos]))
    })?;

    let mut alleles = vec![fields[indices.ref_allele].to_string()];
    let alt = fields[indices.alt];
    if alt != "." {
        alleles.extend(alt.split(',').map(|a| a.to_string()));
    }

    let mut site = VariantSite::new(fields[indices.chrom], pos, alleles);
    site.id = fields[indices.id].to_string();
    site.qual = fields[indices.qual].to_string();
    site.filter = fields[indices.filter].to_string();
    site.info = fields[indices.info].to_string();

    let gt_index = indices
        .format
        .and_then(|f| fields.get(f))
        .and_then(|format| format.split(':').position(|key| key == "GT"));

    if let Some(gt_index) = gt_index {
        for (column, sample) in fields.iter().skip(indices.samples_start).zip(samples) {
            let gt = column.split(':').nth(gt_index).unwrap_or(".");
            if let Some(call) = parse_genotype(sample, gt, &site.alleles)? {
                site.genotypes.push(call);
            }
        }
    }

    Ok(site)
}

/// VCF file reader that handles both compressed and uncompressed files
pub struct VcfReader {
    reader: Box<dyn BufRead>,
    header: VcfHeader,
    pending: Option<String>,
}

impl VcfReader {
    /// Open `path` and consume its header
    pub fn new<P: AsRef<Path>>(path: P) -> PgenResult<Self> {
        let file = File::open(&path)
            .map_err(|_| PgenError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

        let mut reader: Box<dyn BufRead> = if is_gzipped(&path)? {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut header = VcfHeader::default();
        let mut pending = None;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.starts_with("##") {
                header.meta_lines.push(trimmed.to_string());
            } else if trimmed.starts_with('#') {
                header.parse_column_line(trimmed)?;
                break;
            } else if !trimmed.is_empty() {
                // headerless file: the first data line is already consumed
                pending = Some(trimmed.to_string());
                break;
            }
        }

        Ok(VcfReader {
            reader,
            header,
            pending,
        })
    }

    pub fn header(&self) -> &VcfHeader {
        &self.header
    }

    pub fn records(&mut self) -> VcfRecordIterator<'_> {
        VcfRecordIterator { vcf: self }
    }

    fn parse_line(&self, line: &str) -> PgenResult<VariantSite> {
        match &self.header.columns {
            Some(indices) => parse_record(line, indices, &self.header.samples),
            None => {
                let columns = line.split('\t').count();
                parse_record(line, &VcfColumnIndices::standard(columns), &self.header.samples)
            }
        }
    }
}

/// Iterator over VCF records
pub struct VcfRecordIterator<'a> {
    vcf: &'a mut VcfReader,
}

impl<'a> Iterator for VcfRecordIterator<'a> {
    type Item = PgenResult<VariantSite>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.vcf.pending.take() {
            return Some(self.vcf.parse_line(&line));
        }

        let mut line = String::new();
        loop {
            line.clear();
            match self.vcf.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = line.trim_end();
                    if line.starts_with('#') || line.is_empty() {
                        continue;
                    }
                    return Some(self.vcf.parse_line(line));
                }
                Err(e) => return Some(Err(PgenError::Io(e))),
            }
        }
    }
}

/// Count data lines in a VCF, for write modes that need the variant count up front
pub fn count_vcf_records<P: AsRef<Path>>(path: P) -> PgenResult<u64> {
    let file = File::open(&path)
        .map_err(|_| PgenError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    let reader: Box<dyn BufRead> = if is_gzipped(&path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        if !line.starts_with('#') && !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
