//! Run metrics and the end-of-run JSON report.
//!
//! Input counters accumulate per reader thread and fold into the run
//! telemetry at end of file; output counters are updated by the telemetry
//! pipeline stage. The two sides must reconcile exactly (error 230) unless
//! reads were rejected by the error budget or removed as duplicates.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::error::{LoaderError, Result};
use crate::read::{Read, READ_TYPE_TECHNICAL};

/// Byte and character tallies on the input side of one reader.
#[derive(Clone)]
pub struct InputMetrics {
    pub defline_len: u64,
    pub sequence_len: u64,
    pub quality_len: u64,
    pub rejected_read_count: u64,
    pub duplicate_reads_count: u64,
    pub duplicate_reads_len: u64,
    pub base_counts: [u64; 256],
    pub quality_counts: BTreeMap<i16, u64>,
}

impl Default for InputMetrics {
    fn default() -> Self {
        InputMetrics {
            defline_len: 0,
            sequence_len: 0,
            quality_len: 0,
            rejected_read_count: 0,
            duplicate_reads_count: 0,
            duplicate_reads_len: 0,
            base_counts: [0; 256],
            quality_counts: BTreeMap::new(),
        }
    }
}

impl InputMetrics {
    pub fn fold(&mut self, other: &InputMetrics) {
        self.defline_len += other.defline_len;
        self.sequence_len += other.sequence_len;
        self.quality_len += other.quality_len;
        self.rejected_read_count += other.rejected_read_count;
        self.duplicate_reads_count += other.duplicate_reads_count;
        self.duplicate_reads_len += other.duplicate_reads_len;
        for i in 0..256 {
            self.base_counts[i] += other.base_counts[i];
        }
        for (score, n) in &other.quality_counts {
            *self.quality_counts.entry(*score).or_default() += n;
        }
    }
}

/// Tallies on the emitted side.
pub struct OutputMetrics {
    pub sequence_len: u64,
    pub sequence_len_bio: u64,
    pub quality_len: u64,
    pub base_counts: [u64; 256],
    pub tech_base_counts: [u64; 256],
    pub quality_counts: BTreeMap<i16, u64>,
    pub read_count: u64,
    pub spot_count: u64,
}

impl Default for OutputMetrics {
    fn default() -> Self {
        OutputMetrics {
            sequence_len: 0,
            sequence_len_bio: 0,
            quality_len: 0,
            base_counts: [0; 256],
            tech_base_counts: [0; 256],
            quality_counts: BTreeMap::new(),
            read_count: 0,
            spot_count: 0,
        }
    }
}

/// Per input-group runtime statistics.
#[derive(Default)]
pub struct GroupTelemetry {
    pub files: Vec<String>,
    pub defline_types: BTreeSet<String>,
    pub is_10x: bool,
    pub is_interleaved: bool,
    pub has_read_names: bool,
    pub is_early_end: bool,
    pub number_of_spots: u64,
    pub number_of_reads: u64,
    pub rejected_spots: u64,
    pub reads_per_spot: u32,
    pub number_of_spots_with_orphans: u64,
    pub max_sequence_size: u64,
    pub min_sequence_size: u64,
}

#[derive(Default)]
pub struct AssemblyMetrics {
    pub number_of_far_reads: u64,
    pub reads_stats: BTreeMap<u32, u64>,
}

#[derive(Default)]
pub struct Telemetry {
    pub platform_code: u8,
    pub quality_code: i32,
    pub groups: Vec<GroupTelemetry>,
    pub input: InputMetrics,
    pub output: OutputMetrics,
    pub assembly: AssemblyMetrics,
    pub is_spot_assembly: bool,
    pub timings: BTreeMap<String, f64>,
}

impl Telemetry {
    /// Open a fresh per-group statistics record.
    pub fn start_group(&mut self) {
        self.groups.push(GroupTelemetry {
            min_sequence_size: u64::MAX,
            ..GroupTelemetry::default()
        });
    }

    pub fn group_mut(&mut self) -> &mut GroupTelemetry {
        if self.groups.is_empty() {
            self.start_group();
        }
        self.groups.last_mut().unwrap()
    }

    /// Account an assembled spot about to be (or just) written.
    pub fn update_spot(&mut self, reads: &[Read]) {
        let group = self.group_mut();
        group.number_of_spots += 1;
        group.number_of_reads += reads.len() as u64;
        if (reads.len() as u32) < group.reads_per_spot {
            group.number_of_spots_with_orphans += 1;
        }
        for read in reads {
            let sz = read.sequence().len() as u64;
            group.max_sequence_size = group.max_sequence_size.max(sz);
            group.min_sequence_size = group.min_sequence_size.min(sz);
        }

        self.output.read_count += reads.len() as u64;
        self.output.spot_count += 1;
        for read in reads {
            let sz = read.sequence().len() as u64;
            self.output.sequence_len += sz;
            if read.read_type != READ_TYPE_TECHNICAL {
                self.output.sequence_len_bio += sz;
                for b in read.sequence().bytes() {
                    self.output.base_counts[b as usize] += 1;
                }
            } else {
                for b in read.sequence().bytes() {
                    self.output.tech_base_counts[b as usize] += 1;
                }
            }
            for score in read.qual_scores() {
                *self.output.quality_counts.entry(score).or_default() += 1;
            }
            self.output.quality_len += read.quality().len() as u64;
        }
    }

    /// Verify payload conservation between input and output. Mismatch means
    /// a loader bug, not bad input.
    pub fn conservation_check(&self) -> Result<()> {
        for i in 0..256 {
            let out = self.output.base_counts[i] + self.output.tech_base_counts[i];
            if self.input.base_counts[i] != out {
                return Err(LoaderError::new(
                    230,
                    format!(
                        "Input base counts mismatch for {} : input {} != parsed {}",
                        i as u8 as char, self.input.base_counts[i], out
                    ),
                ));
            }
        }
        for (score, n) in &self.input.quality_counts {
            let out = self.output.quality_counts.get(score).copied().unwrap_or(0);
            if *n != out {
                return Err(LoaderError::new(
                    230,
                    format!(
                        "Input quality counts mismatch for {} : input {} != parsed {}",
                        score, n, out
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn report(&self) -> Value {
        let mut defline_types = BTreeSet::new();
        let groups: Vec<Value> = self
            .groups
            .iter()
            .map(|g| {
                defline_types.extend(g.defline_types.iter().cloned());
                json!({
                    "files": g.files,
                    "is_10x": g.is_10x,
                    "is_early_end": g.is_early_end,
                    "number_of_spots": g.number_of_spots,
                    "number_of_reads": g.number_of_reads,
                    "rejected_spots": g.rejected_spots,
                    "is_interleaved": g.is_interleaved,
                    "has_read_names": g.has_read_names,
                    "defline_type": g.defline_types,
                    "reads_per_spot": g.reads_per_spot,
                    "number_of_spots_with_orphans": g.number_of_spots_with_orphans,
                    "max_sequence_size": g.max_sequence_size,
                    "min_sequence_size": if g.min_sequence_size == u64::MAX { 0 } else { g.min_sequence_size },
                })
            })
            .collect();

        let mut input = json!({
            "defline_len": self.input.defline_len,
            "sequence_len": self.input.sequence_len,
            "quality_len": self.input.quality_len,
        });
        if self.input.rejected_read_count > 0 {
            input["rejected_reads"] = self.input.rejected_read_count.into();
        }
        if self.input.duplicate_reads_count > 0 {
            input["duplicate_reads"] = self.input.duplicate_reads_count.into();
            input["duplicate_reads_len"] = self.input.duplicate_reads_len.into();
        }
        if self.is_spot_assembly {
            input["far_reads"] = self.assembly.number_of_far_reads.into();
        }

        let base_counts: BTreeMap<String, u64> = (0..256)
            .filter(|&i| self.output.base_counts[i] != 0)
            .map(|i| ((i as u8 as char).to_string(), self.output.base_counts[i]))
            .collect();
        let quality_counts: BTreeMap<String, u64> = self
            .output
            .quality_counts
            .iter()
            .map(|(score, n)| (score.to_string(), *n))
            .collect();

        let output = json!({
            "sequence_len": self.output.sequence_len,
            "sequence_len_bio": self.output.sequence_len_bio,
            "quality_len": self.output.quality_len,
            "base_counts": base_counts,
            "quality_counts": quality_counts,
            "read_count": self.output.read_count,
            "spot_count": self.output.spot_count,
        });

        let mut qc = json!({});
        if self.output.sequence_len > 0 {
            let loss = self.input.sequence_len as i64 - self.output.sequence_len as i64;
            qc["sequence_loss"] = loss.into();
            qc["pct_sequence_loss"] =
                format!("{:.2}", 100.0 * loss as f64 / self.output.sequence_len as f64).into();
        }
        if self.output.quality_len > 0 {
            let loss = self.input.quality_len as i64 - self.output.quality_len as i64;
            qc["quality_loss"] = loss.into();
            qc["pct_quality_loss"] =
                format!("{:.2}", 100.0 * loss as f64 / self.output.quality_len as f64).into();
        }

        let mut report = json!({
            "platform_code": self.platform_code,
            "quality_code": self.quality_code,
            "groups": groups,
            "defline_types": defline_types,
            "i": input,
            "o": output,
            "qc": qc,
            "timing": self.timings,
        });
        if self.is_spot_assembly {
            report["is_spot_assembly"] = 1.into();
            report["reads_stats"] = json!(self
                .assembly
                .reads_stats
                .iter()
                .map(|(reads, spots)| (reads.to_string(), *spots))
                .collect::<BTreeMap<String, u64>>());
        }
        report
    }
}

/// Peak resident set size in kB, from /proc on Linux.
#[cfg(target_os = "linux")]
pub fn peak_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn peak_rss_kb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_read(seq: &str, qual: &str, read_type: u8) -> Read {
        let mut read = Read::default();
        read.set_sequence(seq);
        read.set_quality(qual);
        read.read_type = read_type;
        read
    }

    #[test]
    fn test_conservation_balances_bio_and_technical() {
        let mut t = Telemetry::default();
        for b in "GATTNN".bytes() {
            t.input.base_counts[b as usize] += 1;
        }
        for b in "!!!!!!".bytes() {
            *t.input.quality_counts.entry(b as i16).or_default() += 1;
        }
        let spot = vec![
            mk_read("GATT", "!!!!", crate::read::READ_TYPE_BIOLOGICAL),
            mk_read("NN", "!!", READ_TYPE_TECHNICAL),
        ];
        t.update_spot(&spot);
        t.conservation_check().unwrap();
        assert_eq!(t.output.sequence_len, 6);
        assert_eq!(t.output.sequence_len_bio, 4);
    }

    #[test]
    fn test_conservation_detects_loss() {
        let mut t = Telemetry::default();
        t.input.base_counts[b'A' as usize] = 4;
        let e = t.conservation_check().unwrap_err();
        assert_eq!(e.code(), 230);
    }

    #[test]
    fn test_report_shape() {
        let mut t = Telemetry::default();
        t.platform_code = 2;
        t.quality_code = 33;
        let spot = vec![mk_read("ACGT", "IIII", crate::read::READ_TYPE_BIOLOGICAL)];
        t.update_spot(&spot);
        let report = t.report();
        assert_eq!(report["platform_code"], 2);
        assert_eq!(report["o"]["spot_count"], 1);
        assert_eq!(report["o"]["base_counts"]["A"], 1);
    }
}
