//! Prefix-sampling pass over the inputs.
//!
//! The digest reads a bounded number of spots from every file and fixes the
//! run layout for the main pass: platform, quality encoding, reads per
//! spot, 10x grouping, and an estimated total spot count extrapolated from
//! bytes consumed.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorBudget, LoaderError, Result};
use crate::read::{Platform, Read};
use crate::reader::{FastqReader, ScoreValidator};

pub const DEFAULT_DIGEST_SPOTS: i64 = 250_000;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileDigest {
    pub file_path: String,
    pub file_size: u64,
    pub is_compressed: bool,
    pub first_name: String,
    pub defline_type: Vec<String>,
    pub platform_code: Vec<u8>,
    pub quality_encoding: i32,
    pub max_reads: u32,
    pub has_orphans: bool,
    #[serde(rename = "readNums")]
    pub read_nums: Vec<String>,
    pub reads_processed: u64,
    pub spots_processed: u64,
    pub lines_processed: u64,
    pub name_size_avg: u64,
    #[serde(rename = "readType", default)]
    pub read_types: Vec<char>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GroupDigest {
    pub files: Vec<FileDigest>,
    pub is_10x: bool,
    pub estimated_spots: u64,
    pub total_reads: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Digest {
    pub groups: Vec<GroupDigest>,
    pub defline: String,
}

/// Observed quality characteristics of one file's sampled prefix.
#[derive(Debug)]
struct QualParams {
    min_score: i32,
    max_score: i32,
    initialized: bool,
    space_delimited: bool,
}

impl Default for QualParams {
    fn default() -> Self {
        QualParams {
            min_score: '~' as i32,
            max_score: '!' as i32,
            initialized: false,
            space_delimited: false,
        }
    }
}

impl QualParams {
    fn set_score(&mut self, score: i32) -> bool {
        if self.space_delimited {
            if !(-5..=40).contains(&score) {
                return false;
            }
        } else if !(33..=126).contains(&score) {
            return false;
        }
        self.min_score = self.min_score.min(score);
        self.max_score = self.max_score.max(score);
        true
    }

    fn check_read(&mut self, read: &Read) -> Result<()> {
        let quality = read.quality();
        if !self.initialized {
            self.space_delimited = quality.bytes().any(|b| b.is_ascii_whitespace());
            self.initialized = true;
        }
        if self.space_delimited {
            for token in quality.split_ascii_whitespace() {
                let score: i32 = token.parse().map_err(|_| {
                    LoaderError::new(
                        140,
                        format!("Read {}: quality score contains unexpected character", read.spot()),
                    )
                })?;
                if !self.set_score(score) {
                    return Err(LoaderError::new(
                        140,
                        format!(
                            "Read {}: quality score contains unexpected character '{}'",
                            read.spot(),
                            score
                        ),
                    ));
                }
            }
        } else {
            for b in quality.bytes() {
                if !self.set_score(b as i32) {
                    return Err(LoaderError::new(
                        140,
                        format!(
                            "Read {}: quality score contains unexpected character '{}'",
                            read.spot(),
                            b as i32
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn encoding(&self, file_name: &str, line: u64) -> Result<i32> {
        if self.space_delimited {
            Ok(0)
        } else if self.min_score >= 64 && self.max_score > 78 {
            Ok(64)
        } else if self.min_score >= 33 {
            Ok(33)
        } else {
            Err(LoaderError::new(
                200,
                format!("Invalid quality encoding (min: {}, max: {})", self.min_score, self.max_score),
            )
            .with_file(file_name, line))
        }
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Sample up to `num_spots` spots per file (negative means the whole file).
pub fn get_digest(
    input_batches: &[Vec<String>],
    budget: &ErrorBudget,
    num_spots: i64,
) -> Result<Digest> {
    let re_10x_i = Regex::new(r"[_-]I\d+[._]").expect("10x pattern");
    let re_10x_r = Regex::new(r"[_-]R\d+[._]").expect("10x pattern");
    let mut has_i_file = false;
    let mut has_r_file = false;
    let mut has_non_10x = false;
    let mut digest = Digest::default();

    for files in input_batches {
        let mut group = GroupDigest::default();
        let mut group_reads = 0u32;
        for file_name in files {
            let mut f = FileDigest {
                file_path: file_name.clone(),
                ..FileDigest::default()
            };
            if file_name != "-" {
                f.file_size = std::fs::metadata(file_name).map(|m| m.len()).unwrap_or(0);
            }
            if re_10x_i.is_match(file_name) {
                has_i_file = true;
            } else if re_10x_r.is_match(file_name) {
                has_r_file = true;
            } else {
                has_non_10x = true;
            }

            let mut reader = FastqReader::open(
                file_name,
                Vec::new(),
                Platform::Undefined,
                true,
                ScoreValidator::None,
            )?;
            let mut reads: Vec<Read> = Vec::new();
            let mut params = QualParams::default();
            let mut spot_name_sz = 0u64;
            let mut remaining = num_spots;
            let mut spot_name = None;

            while spot_name.is_none() && remaining != 0 {
                match reader.get_next_spot(&mut reads) {
                    Ok(name) => {
                        spot_name = name;
                        if remaining > 0 {
                            remaining -= 1;
                        }
                        if spot_name.is_none() {
                            break;
                        }
                    }
                    Err(e) => budget.check(e)?,
                }
            }
            let mut spot_name = spot_name
                .ok_or_else(|| LoaderError::new(50, format!("File '{}' has no reads", file_name)))?;

            f.is_compressed = reader.is_compressed();
            f.max_reads = reads.len() as u32;
            f.reads_processed += reads.len() as u64;
            f.spots_processed += 1;
            for read in &reads {
                if !read.read_num().is_empty() {
                    push_unique(&mut f.read_nums, read.read_num().to_string());
                }
                if let Err(e) = params.check_read(read) {
                    budget.check(e.with_file(file_name, read.line_number))?;
                }
            }
            let suffix = reads.first().map(|r| r.suffix().to_string()).unwrap_or_default();
            spot_name.push_str(&suffix);
            spot_name_sz += spot_name.len() as u64;
            f.first_name = spot_name;

            let mut last_line = 0u64;
            loop {
                push_unique(&mut f.defline_type, reader.defline_type().to_string());
                push_unique(&mut f.platform_code, reader.platform() as u8);
                if num_spots >= 0 {
                    remaining -= 1;
                    if remaining <= 0 {
                        break;
                    }
                }
                reads.clear();
                match reader.get_next_spot(&mut reads) {
                    Ok(Some(name)) => {
                        f.spots_processed += 1;
                        f.reads_processed += reads.len() as u64;
                        if f.max_reads > reads.len() as u32 {
                            f.has_orphans = true;
                        }
                        f.max_reads = f.max_reads.max(reads.len() as u32);
                        let suffix =
                            reads.first().map(|r| r.suffix().to_string()).unwrap_or_default();
                        spot_name_sz += (name.len() + suffix.len()) as u64;
                        for read in &reads {
                            last_line = read.line_number;
                            if !read.read_num().is_empty() {
                                push_unique(&mut f.read_nums, read.read_num().to_string());
                            }
                            if let Err(e) = params.check_read(read) {
                                budget.check(e.with_file(file_name, read.line_number))?;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => budget.check(e)?,
                }
            }
            f.quality_encoding = params.encoding(file_name, last_line)?;
            group_reads += f.max_reads;
            f.lines_processed = reader.line_number();
            let bytes_read = reader.tellg();
            if bytes_read > 0 && f.spots_processed > 0 {
                let bytes_per_spot = bytes_read as f64 / f.spots_processed as f64;
                group.estimated_spots =
                    group.estimated_spots.max((f.file_size as f64 / bytes_per_spot) as u64);
                f.name_size_avg = spot_name_sz / f.spots_processed;
            }
            group.files.push(f);
        }
        group.is_10x = group_reads >= 3 && has_i_file && has_r_file;
        if has_non_10x && group.is_10x {
            return Err(LoaderError::from_code(80));
        }
        digest.groups.push(group);
    }

    let mut deflines: Vec<String> = Vec::new();
    for group in &digest.groups {
        for f in &group.files {
            for d in &f.defline_type {
                push_unique(&mut deflines, d.clone());
            }
        }
    }
    deflines.sort();
    digest.defline = if deflines.is_empty() { "unknown".to_string() } else { deflines.join(",") };
    Ok(digest)
}

/// Validate the digest and fix the run layout: unique platform, consistent
/// 10x grouping, quality override, read-type defaults and per-file
/// assignment.
pub fn process_digest(
    digest: &mut Digest,
    read_types: &mut Vec<char>,
    spot_assembly: bool,
    has_read_pairs: bool,
    quality_override: Option<i32>,
) -> Result<()> {
    let first = digest
        .groups
        .first()
        .and_then(|g| g.files.first())
        .ok_or_else(|| LoaderError::runtime("Empty digest"))?;
    if first.platform_code.len() > 1 {
        return Err(LoaderError::new(
            70,
            format!(
                "Input file has data from multiple platforms ({} != {})",
                first.platform_code[0], first.platform_code[1]
            ),
        ));
    }
    let is_10x = digest.groups[0].is_10x;
    let platform = first.platform_code.first().copied().unwrap_or(0);

    let mut total_reads = 0u32;
    for group in &mut digest.groups {
        let mut max_reads = 0u32;
        let mut group_reads = 0u32;
        if group.is_10x != is_10x {
            return Err(LoaderError::from_code(80));
        }
        for f in &mut group.files {
            if f.defline_type.is_empty()
                || (f.defline_type.len() == 1 && f.defline_type[0] == "undefined")
            {
                return Err(LoaderError::new(100, "Defline not recognized").with_file(&f.file_path, 1));
            }
            if let Some(q) = quality_override {
                f.quality_encoding = q;
            }
            if f.platform_code.len() > 1 {
                return Err(LoaderError::new(
                    70,
                    format!(
                        "Input file has data from multiple platforms ({} != {})",
                        f.platform_code[0], f.platform_code[1]
                    ),
                ));
            }
            if f.platform_code.first().copied().unwrap_or(0) != platform {
                return Err(LoaderError::new(
                    70,
                    format!(
                        "Input files have deflines from different platforms ({} != {})",
                        platform,
                        f.platform_code.first().copied().unwrap_or(0)
                    ),
                ));
            }
            max_reads = max_reads.max(f.max_reads);
            group_reads += f.max_reads;
            if !spot_assembly
                && !read_types.is_empty()
                && max_reads > 1
                && f.has_orphans
                && f.read_nums.is_empty()
            {
                return Err(LoaderError::from_code(190));
            }
        }
        if (has_read_pairs || !spot_assembly) && !read_types.is_empty() {
            if read_types.len() != group_reads as usize {
                return Err(LoaderError::new(
                    30,
                    format!(
                        "readTypes number should match the number of reads {} != {}",
                        read_types.len(),
                        group_reads
                    ),
                ));
            }
        }
        total_reads = total_reads.max(group_reads);
        group.total_reads = total_reads;
    }

    if !spot_assembly {
        let estimated: u64 = digest.groups.iter().map(|g| g.estimated_spots).sum();
        if estimated > u32::MAX as u64 {
            return Err(LoaderError::from_code(250));
        }
        if read_types.is_empty() {
            if is_10x {
                read_types.resize(total_reads as usize, 'A');
            } else if total_reads < 3 {
                read_types.resize(total_reads as usize, 'B');
            } else {
                return Err(LoaderError::new(
                    20,
                    format!(
                        "The input data have spots with {} reads. Read types must be provided via parameter.",
                        total_reads
                    ),
                ));
            }
        }
        for group in &mut digest.groups {
            if read_types.len() < group.total_reads as usize {
                return Err(LoaderError::new(30, "readTypes number should match the number of reads"));
            }
            let mut j = 0usize;
            for f in &mut group.files {
                for _ in 0..f.max_reads {
                    f.read_types.push(read_types[j]);
                    j += 1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn digest_one(body: &str) -> Digest {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "reads.fastq", body);
        let budget = ErrorBudget::new(100);
        get_digest(&[vec![path]], &budget, DEFAULT_DIGEST_SPOTS).unwrap()
    }

    #[test]
    fn test_digest_phred33() {
        let digest = digest_one("@A 1:N:0:X\nGATT\n+\n!!!!\n@B 1:N:0:X\nACGT\n+\nIIII\n");
        let f = &digest.groups[0].files[0];
        assert_eq!(f.quality_encoding, 33);
        assert_eq!(f.max_reads, 1);
        assert_eq!(f.spots_processed, 2);
        assert!(!f.has_orphans);
        assert_eq!(f.platform_code, vec![Platform::Illumina as u8]);
    }

    #[test]
    fn test_digest_phred64() {
        let digest = digest_one("@A 1:N:0:X\nGATT\n+\nabcd\n");
        assert_eq!(digest.groups[0].files[0].quality_encoding, 64);
    }

    #[test]
    fn test_digest_numeric() {
        let digest = digest_one("@A 1:N:0:X\nGATT\n+\n30 31 32 33\n");
        assert_eq!(digest.groups[0].files[0].quality_encoding, 0);
    }

    #[test]
    fn test_digest_detects_orphans_and_read_count() {
        let body = "@S 1:N:0:G\nGA\n+\n!!\n@S 2:N:0:G\nTT\n+\n!!\n@T 1:N:0:G\nCC\n+\n!!\n";
        let digest = digest_one(body);
        let f = &digest.groups[0].files[0];
        assert_eq!(f.max_reads, 2);
        assert!(f.has_orphans);
        assert_eq!(f.read_nums, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_digest_empty_file_is_error_50() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.fastq", "");
        let budget = ErrorBudget::new(100);
        let e = get_digest(&[vec![path]], &budget, DEFAULT_DIGEST_SPOTS).unwrap_err();
        assert_eq!(e.code(), 50);
    }

    #[test]
    fn test_process_digest_defaults_read_types() {
        let mut digest = digest_one("@A 1:N:0:X\nGATT\n+\n!!!!\n");
        let mut read_types = Vec::new();
        process_digest(&mut digest, &mut read_types, false, false, None).unwrap();
        assert_eq!(read_types, vec!['B']);
        assert_eq!(digest.groups[0].files[0].read_types, vec!['B']);
    }

    #[test]
    fn test_process_digest_platform_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = write_file(&dir, "a.fastq", "@A 1:N:0:X\nGATT\n+\n!!!!\n");
        let p2 = write_file(
            &dir,
            "b.fastq",
            "@channel_100_read_42_template\nGATT\n+\n!!!!\n",
        );
        let budget = ErrorBudget::new(100);
        let mut digest =
            get_digest(&[vec![p1], vec![p2]], &budget, DEFAULT_DIGEST_SPOTS).unwrap();
        let mut read_types = Vec::new();
        let e = process_digest(&mut digest, &mut read_types, false, false, None).unwrap_err();
        assert_eq!(e.code(), 70);
    }

    #[test]
    fn test_process_digest_quality_override() {
        let mut digest = digest_one("@A 1:N:0:X\nGATT\n+\nIIII\n");
        let mut read_types = vec!['B'];
        process_digest(&mut digest, &mut read_types, false, false, Some(64)).unwrap();
        assert_eq!(digest.groups[0].files[0].quality_encoding, 64);
    }
}
