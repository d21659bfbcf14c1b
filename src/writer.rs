//! Marshalling of assembled spots into the columnar writer's row form.
//!
//! The on-disk column format itself is a collaborator behind [`RowSink`];
//! this module owns the row shape, the NAME column policy, per-run content
//! fingerprints and the archive metadata keys written at close.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::read::{Platform, Read};

pub const WRITER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Running content digest over read sequences: per-base tallies plus a
/// SHA-1 over the concatenated bases.
#[derive(Clone)]
pub struct Fingerprint {
    base_counts: [u64; 5],
    total_reads: u64,
    hasher: Sha1,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Fingerprint { base_counts: [0; 5], total_reads: 0, hasher: Sha1::new() }
    }
}

impl Fingerprint {
    pub fn record(&mut self, sequence: &str) {
        self.total_reads += 1;
        for b in sequence.bytes() {
            let i = match b {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                b'T' => 3,
                _ => 4,
            };
            self.base_counts[i] += 1;
        }
        self.hasher.update(sequence.as_bytes());
    }

    pub fn json(&self) -> String {
        format!(
            "{{\"A\":{},\"C\":{},\"G\":{},\"T\":{},\"N\":{},\"reads\":{}}}",
            self.base_counts[0],
            self.base_counts[1],
            self.base_counts[2],
            self.base_counts[3],
            self.base_counts[4],
            self.total_reads
        )
    }

    pub fn digest(&self) -> String {
        let out = self.hasher.clone().finalize();
        out.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn algorithm() -> &'static str {
        "sha1-base-counts"
    }

    pub fn format() -> &'static str {
        "json"
    }
}

/// One archive row, ready for the columnar writer.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SpotRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub read: String,
    pub quality: Vec<i16>,
    pub read_start: Vec<i32>,
    pub read_len: Vec<i32>,
    pub read_type: Vec<u8>,
    pub read_filter: Vec<u8>,
    pub spot_group: String,
    pub platform: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_number: Option<Vec<u32>>,
}

/// The columnar writer contract the loader depends on.
pub trait RowSink: Send {
    fn write_row(&mut self, row: &SpotRow) -> Result<()>;
    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()>;
    fn set_metadata_attr(&mut self, key: &str, attr: &str, value: &str) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Streams rows as JSON lines; the stand-in for the archive writer.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out }
    }
}

impl<W: Write + Send> RowSink for JsonLinesSink<W> {
    fn write_row(&mut self, row: &SpotRow) -> Result<()> {
        serde_json::to_writer(&mut self.out, row)
            .map_err(|e| crate::error::LoaderError::runtime(format!("row write failed: {}", e)))?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        let line = serde_json::json!({"meta": key, "value": value});
        self.out.write_all(line.to_string().as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn set_metadata_attr(&mut self, key: &str, attr: &str, value: &str) -> Result<()> {
        let line = serde_json::json!({"meta": key, "attr": attr, "value": value});
        self.out.write_all(line.to_string().as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Collects rows and metadata in memory.
#[derive(Default)]
pub struct MemoryRowSink {
    pub rows: Vec<SpotRow>,
    pub metadata: BTreeMap<String, String>,
}

impl RowSink for MemoryRowSink {
    fn write_row(&mut self, row: &SpotRow) -> Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_metadata_attr(&mut self, key: &str, attr: &str, value: &str) -> Result<()> {
        self.metadata.insert(format!("{}@{}", key, attr), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameColumn {
    None,
    Name,
    RawName,
}

impl NameColumn {
    pub fn parse(value: &str) -> Option<NameColumn> {
        match value {
            "NONE" => Some(NameColumn::None),
            "NAME" => Some(NameColumn::Name),
            "RAW_NAME" => Some(NameColumn::RawName),
            _ => None,
        }
    }
}

/// Adapter from assembled spots to archive rows.
pub struct SpotWriter {
    sink: Box<dyn RowSink>,
    platform: Platform,
    name_column: NameColumn,
    read_fingerprint: Fingerprint,
    source_fingerprints: Vec<(String, Fingerprint)>,
    changes: BTreeMap<(String, String), u32>,
    spots_written: u64,
    batch_size: u64,
}

impl SpotWriter {
    pub fn new(sink: Box<dyn RowSink>, platform: Platform, name_column: NameColumn) -> Self {
        SpotWriter {
            sink,
            platform,
            name_column,
            read_fingerprint: Fingerprint::default(),
            source_fingerprints: Vec::new(),
            changes: BTreeMap::new(),
            spots_written: 0,
            batch_size: 10_000,
        }
    }

    pub fn spots_written(&self) -> u64 {
        self.spots_written
    }

    /// Rows are flushed through the sink in batches of this many spots.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1) as u64;
    }

    pub fn set_source_fingerprint(&mut self, source: &str, fingerprint: Fingerprint) {
        self.source_fingerprints.push((source.to_string(), fingerprint));
    }

    /// Count one observed change of a category (quality edited, flags
    /// reconciled, record discarded with reason).
    pub fn record_change(&mut self, change: &str, reason: &str) {
        *self.changes.entry((change.to_string(), reason.to_string())).or_default() += 1;
    }

    pub fn write_spot(&mut self, spot_name: &str, reads: &[Read]) -> Result<()> {
        if reads.is_empty() {
            return Ok(());
        }
        let first = &reads[0];
        let name = match self.name_column {
            NameColumn::None => None,
            NameColumn::Name | NameColumn::RawName => {
                Some(format!("{}{}", spot_name, first.suffix()))
            }
        };
        let is_nanopore = self.platform == Platform::OxfordNanopore;
        let mut row = SpotRow {
            name,
            read: String::new(),
            quality: Vec::new(),
            read_start: Vec::with_capacity(reads.len()),
            read_len: Vec::with_capacity(reads.len()),
            read_type: Vec::with_capacity(reads.len()),
            read_filter: Vec::with_capacity(reads.len()),
            spot_group: first.spot_group().to_string(),
            platform: self.platform as u8,
            channel: is_nanopore.then(Vec::new),
            read_number: is_nanopore.then(Vec::new),
        };
        let mut start = 0i32;
        for read in reads {
            row.read.push_str(read.sequence());
            self.read_fingerprint.record(read.sequence());
            row.quality.extend(read.qual_scores());
            row.read_start.push(start);
            let sz = read.sequence().len() as i32;
            start += sz;
            row.read_len.push(sz);
            row.read_type.push(read.read_type);
            row.read_filter.push(read.read_filter());
            if is_nanopore {
                row.channel
                    .as_mut()
                    .unwrap()
                    .push(read.channel().parse().unwrap_or(0));
                row.read_number
                    .as_mut()
                    .unwrap()
                    .push(read.nanopore_read_no().parse().unwrap_or(0));
            }
        }
        self.sink.write_row(&row)?;
        self.spots_written += 1;
        if self.spots_written % self.batch_size == 0 {
            self.sink.flush()?;
        }
        Ok(())
    }

    /// Write run metadata: input fingerprints, the output fingerprint, and
    /// the change counters (32-bit big-endian counts).
    pub fn close(&mut self) -> Result<()> {
        for (i, (source, fp)) in self.source_fingerprints.iter().enumerate() {
            let key = format!("LOAD/QC/file_{}", i + 1);
            self.sink.set_metadata(&key, &fp.json())?;
            self.sink.set_metadata_attr(&key, "name", source)?;
            self.sink.set_metadata_attr(&key, "digest", &fp.digest())?;
            self.sink.set_metadata_attr(&key, "algorithm", Fingerprint::algorithm())?;
            self.sink.set_metadata_attr(&key, "version", WRITER_VERSION)?;
            self.sink.set_metadata_attr(&key, "format", Fingerprint::format())?;
        }

        self.sink.set_metadata("QC/current/fingerprint", &self.read_fingerprint.json())?;
        self.sink.set_metadata("QC/current/digest", &self.read_fingerprint.digest())?;
        self.sink.set_metadata("QC/current/algorithm", Fingerprint::algorithm())?;
        self.sink.set_metadata("QC/current/version", WRITER_VERSION)?;
        self.sink.set_metadata("QC/current/format", Fingerprint::format())?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.sink.set_metadata("QC/current/timestamp", &timestamp.to_string())?;

        for (n, ((change, reason), count)) in self.changes.iter().enumerate() {
            let key = format!("CHANGES/{}_{}", change, n + 1);
            let be: String = count.to_be_bytes().iter().map(|b| format!("{:02x}", b)).collect();
            self.sink.set_metadata(&key, &be)?;
            self.sink.set_metadata_attr(&key, "change", change)?;
            self.sink.set_metadata_attr(&key, "reason", reason)?;
        }
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::{READ_TYPE_BIOLOGICAL, READ_TYPE_TECHNICAL};
    use std::sync::{Arc, Mutex};

    /// Sink that shares its memory with the test after the writer owns it.
    struct SharedSink(Arc<Mutex<MemoryRowSink>>);

    impl RowSink for SharedSink {
        fn write_row(&mut self, row: &SpotRow) -> Result<()> {
            self.0.lock().unwrap().write_row(row)
        }
        fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().set_metadata(key, value)
        }
        fn set_metadata_attr(&mut self, key: &str, attr: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().set_metadata_attr(key, attr, value)
        }
    }

    fn shared_writer(
        platform: Platform,
        name_column: NameColumn,
    ) -> (SpotWriter, Arc<Mutex<MemoryRowSink>>) {
        let store = Arc::new(Mutex::new(MemoryRowSink::default()));
        let writer = SpotWriter::new(Box::new(SharedSink(store.clone())), platform, name_column);
        (writer, store)
    }

    fn mk_read(seq: &str, scores: &[i16], read_type: u8) -> Read {
        let mut read = Read::default();
        read.set_sequence(seq);
        read.set_qual_scores(scores.to_vec());
        read.read_type = read_type;
        read
    }

    #[test]
    fn test_paired_spot_row_shape() {
        let (mut writer, store) = shared_writer(Platform::Illumina, NameColumn::Name);
        let mut r1 = mk_read("GATT", &[33; 4], READ_TYPE_BIOLOGICAL);
        r1.set_spot_group("G");
        let r2 = mk_read("ACGTA", &[40; 5], READ_TYPE_TECHNICAL);
        writer.write_spot("S", &[r1, r2]).unwrap();

        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 1);
        let row = &sink.rows[0];
        assert_eq!(row.name.as_deref(), Some("S"));
        assert_eq!(row.read, "GATTACGTA");
        assert_eq!(row.quality, vec![33, 33, 33, 33, 40, 40, 40, 40, 40]);
        assert_eq!(row.read_start, vec![0, 4]);
        assert_eq!(row.read_len, vec![4, 5]);
        assert_eq!(row.read_type, vec![READ_TYPE_BIOLOGICAL, READ_TYPE_TECHNICAL]);
        assert_eq!(row.spot_group, "G");
        assert!(row.channel.is_none());
    }

    #[test]
    fn test_name_includes_suffix() {
        let (mut writer, store) = shared_writer(Platform::Illumina, NameColumn::Name);
        let mut read = mk_read("ACGT", &[40; 4], READ_TYPE_BIOLOGICAL);
        read.set_suffix("_suf");
        writer.write_spot("S", &[read]).unwrap();
        assert_eq!(store.lock().unwrap().rows[0].name.as_deref(), Some("S_suf"));
    }

    #[test]
    fn test_name_column_none_drops_names() {
        let (mut writer, store) = shared_writer(Platform::Illumina, NameColumn::None);
        writer.write_spot("S", &[mk_read("ACGT", &[40; 4], READ_TYPE_BIOLOGICAL)]).unwrap();
        assert!(store.lock().unwrap().rows[0].name.is_none());
    }

    #[test]
    fn test_nanopore_columns_present() {
        let (mut writer, store) = shared_writer(Platform::OxfordNanopore, NameColumn::Name);
        let mut read = mk_read("ACGT", &[40; 4], READ_TYPE_BIOLOGICAL);
        read.set_channel("361");
        read.set_nanopore_read_no("1234");
        writer.write_spot("pore", &[read]).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows[0].channel, Some(vec![361]));
        assert_eq!(sink.rows[0].read_number, Some(vec![1234]));
    }

    #[test]
    fn test_close_writes_fingerprint_metadata() {
        let (mut writer, store) = shared_writer(Platform::Illumina, NameColumn::Name);
        let mut fp = Fingerprint::default();
        fp.record("GATT");
        writer.set_source_fingerprint("reads_1.fastq", fp);
        writer.write_spot("S", &[mk_read("GATT", &[40; 4], READ_TYPE_BIOLOGICAL)]).unwrap();
        writer.record_change("quality", "original quality restored");
        writer.close().unwrap();

        let sink = store.lock().unwrap();
        assert!(sink.metadata.contains_key("LOAD/QC/file_1"));
        assert_eq!(sink.metadata.get("LOAD/QC/file_1@name").map(String::as_str), Some("reads_1.fastq"));
        assert!(sink.metadata.contains_key("QC/current/fingerprint"));
        assert!(sink.metadata.contains_key("QC/current/timestamp"));
        assert!(sink.metadata.contains_key("CHANGES/quality_1"));
        // 32-bit big-endian count of one observed change
        assert_eq!(sink.metadata.get("CHANGES/quality_1").map(String::as_str), Some("00000001"));
    }

    #[test]
    fn test_fingerprint_roundtrip() {
        let mut fp = Fingerprint::default();
        fp.record("GATTACA");
        let json = fp.json();
        assert!(json.contains("\"A\":3"));
        assert!(json.contains("\"reads\":1"));
        assert_eq!(fp.digest().len(), 40);
    }
}
