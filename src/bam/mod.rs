//! BAM ingest: order-independent mate resolution over the key index, the
//! memory-mapped arena and the fragment bank.
//!
//! Records stream in once; aligned rows are emitted immediately with a
//! provisional spot id of zero, unmated biological reads wait in the
//! fragment bank until their mate shows up, and two closing sweeps emit
//! solo fragments and rewrite alignment rows with final spot ids.

pub mod arena;
pub mod fragments;
pub mod keys;

/// Distinct suffix for every spill file created by this process, so
/// concurrent loaders (and parallel tests) never share a path.
pub(crate) fn next_spill_id() -> u64 {
    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{LoaderError, Result};
use crate::read::Platform;

use arena::ArenaTable;
use fragments::{FragmentBank, FragmentBlob, FragmentInfo};
use keys::KeyIndex;

// SAM flag bits
const FLAG_PAIRED: u16 = 0x1;
const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_REVERSE: u16 = 0x10;
const FLAG_MATE_REVERSE: u16 = 0x20;
const FLAG_FIRST: u16 = 0x40;
const FLAG_SECOND: u16 = 0x80;
const FLAG_SECONDARY: u16 = 0x100;
const FLAG_QC_FAIL: u16 = 0x200;
const FLAG_DUPLICATE: u16 = 0x400;
const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// One decoded alignment record; the wire decoding itself is the BAM
/// reader's job.
#[derive(Debug, Clone, Default)]
pub struct BamRecordView {
    pub qname: Vec<u8>,
    pub flags: u16,
    pub spot_group: String,
    pub mapq: u8,
    pub tid: i32,
    pub pos: i64,
    pub mtid: i32,
    pub mpos: i64,
    pub tlen: i64,
    pub sequence: String,
    pub quality: Vec<u8>,
    pub ti: u64,
    pub has_color_space: bool,
    pub cs_key: u8,
}

impl BamRecordView {
    fn is_paired(&self) -> bool {
        self.flags & FLAG_PAIRED != 0
    }

    fn is_unmapped(&self) -> bool {
        self.flags & FLAG_UNMAPPED != 0
    }

    fn is_reverse(&self) -> bool {
        self.flags & FLAG_REVERSE != 0
    }

    fn is_secondary(&self) -> bool {
        self.flags & (FLAG_SECONDARY | FLAG_SUPPLEMENTARY) != 0
    }

    fn is_qc_fail(&self) -> bool {
        self.flags & FLAG_QC_FAIL != 0
    }

    fn is_duplicate(&self) -> bool {
        self.flags & FLAG_DUPLICATE != 0
    }
}

/// One read of an emitted sequence spot.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SeqRead {
    pub sequence: String,
    pub quality: Vec<u8>,
    pub aligned: bool,
    pub is_bad: bool,
    pub orientation: u8,
    pub ti: u64,
    pub cs_key: u8,
}

/// A spot emitted to the sequence table.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SequenceSpot {
    pub key_id: u64,
    pub reads: Vec<SeqRead>,
    pub spot_group: String,
    pub platform: u8,
    pub pcr_dup: bool,
    pub is_color_space: bool,
}

/// An alignment-table row; `spot_id` is provisional (zero) until the final
/// rewrite sweep.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct AlignmentRow {
    pub align_id: i64,
    pub key_id: u64,
    pub is_primary: bool,
    pub ref_id: i32,
    pub pos: i64,
    pub mapq: u8,
    pub read_no: u8,
    pub reverse: bool,
    pub mate_reverse: bool,
    pub mate_ref_id: i32,
    pub mate_pos: i64,
    pub template_len: i64,
}

/// The archive side of the BAM path.
pub trait BamSink {
    /// Returns the 1-based sequence row just written.
    fn write_sequence(&mut self, spot: &SequenceSpot) -> Result<u64>;
    fn write_alignment(&mut self, row: &AlignmentRow) -> Result<()>;
    fn update_sequence(&mut self, row: u64, primary_ids: [i64; 2], counts: [u8; 2]) -> Result<()>;
    fn assign_alignment_spot(&mut self, align_row: u64, spot_id: i64) -> Result<()>;
    fn write_coverage(&mut self, ref_name: &str, chunk_start: u64, depth: u64) -> Result<()>;
    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()>;
}

/// In-memory sink used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBamSink {
    pub sequences: Vec<SequenceSpot>,
    pub alignments: Vec<AlignmentRow>,
    pub sequence_updates: Vec<(u64, [i64; 2], [u8; 2])>,
    pub alignment_spots: Vec<(u64, i64)>,
    pub coverage: Vec<(String, u64, u64)>,
    pub metadata: BTreeMap<String, String>,
}

impl BamSink for MemoryBamSink {
    fn write_sequence(&mut self, spot: &SequenceSpot) -> Result<u64> {
        self.sequences.push(spot.clone());
        Ok(self.sequences.len() as u64)
    }

    fn write_alignment(&mut self, row: &AlignmentRow) -> Result<()> {
        self.alignments.push(row.clone());
        Ok(())
    }

    fn update_sequence(&mut self, row: u64, primary_ids: [i64; 2], counts: [u8; 2]) -> Result<()> {
        self.sequence_updates.push((row, primary_ids, counts));
        Ok(())
    }

    fn assign_alignment_spot(&mut self, align_row: u64, spot_id: i64) -> Result<()> {
        self.alignment_spots.push((align_row, spot_id));
        Ok(())
    }

    fn write_coverage(&mut self, ref_name: &str, chunk_start: u64, depth: u64) -> Result<()> {
        self.coverage.push((ref_name.to_string(), chunk_start, depth));
        Ok(())
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Streams the BAM tables as JSON lines; the stand-in for the archive
/// writer.
pub struct JsonLinesBamSink<W: std::io::Write + Send> {
    out: W,
    seq_rows: u64,
}

impl<W: std::io::Write + Send> JsonLinesBamSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesBamSink { out, seq_rows: 0 }
    }

    fn emit(&mut self, value: serde_json::Value) -> Result<()> {
        self.out.write_all(value.to_string().as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: std::io::Write + Send> BamSink for JsonLinesBamSink<W> {
    fn write_sequence(&mut self, spot: &SequenceSpot) -> Result<u64> {
        self.seq_rows += 1;
        let row = self.seq_rows;
        self.emit(serde_json::json!({"table": "SEQUENCE", "row": row, "spot": spot}))?;
        Ok(row)
    }

    fn write_alignment(&mut self, row: &AlignmentRow) -> Result<()> {
        self.emit(serde_json::json!({"table": "ALIGNMENT", "row": row}))
    }

    fn update_sequence(&mut self, row: u64, primary_ids: [i64; 2], counts: [u8; 2]) -> Result<()> {
        self.emit(serde_json::json!({
            "table": "SEQUENCE", "update": row,
            "primary_ids": primary_ids, "alignment_counts": counts,
        }))
    }

    fn assign_alignment_spot(&mut self, align_row: u64, spot_id: i64) -> Result<()> {
        self.emit(serde_json::json!({"table": "ALIGNMENT", "update": align_row, "spot_id": spot_id}))
    }

    fn write_coverage(&mut self, ref_name: &str, chunk_start: u64, depth: u64) -> Result<()> {
        self.emit(serde_json::json!({
            "table": "REFERENCE", "name": ref_name, "chunk": chunk_start, "depth": depth,
        }))
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.emit(serde_json::json!({"meta": key, "value": value}))
    }
}

#[derive(Debug, Clone)]
struct RefInfo {
    name: String,
    length: u64,
}

/// Watches reference positions of primary alignments and keeps per-chunk
/// coverage while the input stays coordinate-sorted.
pub struct RefTracker {
    refs: Vec<RefInfo>,
    last_offset: Vec<u64>,
    coverage: BTreeMap<(i32, u64), u64>,
    max_seq_len: u64,
    unsorted: bool,
    require_sorted: bool,
}

impl RefTracker {
    pub fn new(max_seq_len: u64, require_sorted: bool, expect_unsorted: bool) -> RefTracker {
        RefTracker {
            refs: Vec::new(),
            last_offset: Vec::new(),
            coverage: BTreeMap::new(),
            max_seq_len: max_seq_len.max(1),
            unsorted: expect_unsorted,
            require_sorted,
        }
    }

    pub fn set_references(&mut self, refs: Vec<(String, u64)>) {
        self.refs = refs.into_iter().map(|(name, length)| RefInfo { name, length }).collect();
        self.last_offset = vec![0; self.refs.len()];
    }

    pub fn is_known(&self, tid: i32) -> bool {
        tid >= 0 && (tid as usize) < self.refs.len()
    }

    pub fn is_unsorted(&self) -> bool {
        self.unsorted
    }

    /// Track one primary alignment's effective offset. A regressing
    /// position switches the run to unsorted mode, or fails it under
    /// `--require-sorted`.
    pub fn observe(&mut self, tid: i32, offset: u64) -> Result<()> {
        if self.unsorted {
            return Ok(());
        }
        let slot = tid as usize;
        if offset < self.last_offset[slot] {
            if self.require_sorted {
                return Err(LoaderError::runtime("Alignments are unsorted"));
            }
            log::warn!("Alignments are unsorted");
            self.unsorted = true;
            self.coverage.clear();
            return Ok(());
        }
        self.last_offset[slot] = offset;
        let chunk = (offset / self.max_seq_len) * self.max_seq_len;
        *self.coverage.entry((tid, chunk)).or_default() += 1;
        Ok(())
    }

    /// Emit coverage chunks in ascending reference order; nothing is
    /// emitted for unsorted runs.
    pub fn flush(&mut self, sink: &mut dyn BamSink) -> Result<()> {
        for ((tid, chunk), depth) in std::mem::take(&mut self.coverage) {
            let name = &self.refs[tid as usize].name;
            sink.write_coverage(name, chunk, depth)?;
        }
        Ok(())
    }

    pub fn ref_length(&self, tid: i32) -> u64 {
        self.refs.get(tid as usize).map(|r| r.length).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorSpaceState {
    Unknown,
    BaseSpace,
    ColorSpace,
}

pub struct BamLoadOptions {
    pub tmp_dir: PathBuf,
    pub cache_size: u64,
    pub min_map_qual: u8,
    pub accept_bad_dups: bool,
    pub require_sorted: bool,
    pub expect_unsorted: bool,
    pub no_secondary: bool,
    pub max_err_count: u32,
    pub max_seq_len: u64,
}

impl Default for BamLoadOptions {
    fn default() -> Self {
        BamLoadOptions {
            tmp_dir: std::env::temp_dir(),
            cache_size: 1 << 30,
            min_map_qual: 0,
            accept_bad_dups: false,
            require_sorted: false,
            expect_unsorted: false,
            no_secondary: false,
            max_err_count: 100,
            max_seq_len: 5000,
        }
    }
}

fn bump_error(count: &mut u32, max: u32) -> Result<()> {
    *count += 1;
    if max > 0 && *count > max {
        return Err(LoaderError::runtime(format!(
            "Number of errors {} exceeds limit of {}: Exiting",
            count, max
        )));
    }
    Ok(())
}

fn record_change(changes: &mut BTreeMap<(String, String), u32>, change: &str, reason: &str) {
    *changes.entry((change.to_string(), reason.to_string())).or_default() += 1;
}

fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| match b {
            b'A' => 'T',
            b'T' => 'A',
            b'G' => 'C',
            b'C' => 'G',
            b'a' => 't',
            b't' => 'a',
            b'g' => 'c',
            b'c' => 'g',
            other => other as char,
        })
        .collect()
}

pub struct BamLoader<S: BamSink> {
    opts: BamLoadOptions,
    sink: S,
    keys: KeyIndex,
    arena: ArenaTable,
    frags: FragmentBank,
    ref_tracker: RefTracker,
    rg_platforms: BTreeMap<String, Platform>,
    spot_id: i64,
    primary_id: i64,
    secondary_id: i64,
    align_count: u64,
    records_read: u64,
    records_processed: u64,
    err_count: u32,
    color_space: ColorSpaceState,
    seq_row_keys: Vec<u64>,
    align_row_keys: Vec<u64>,
    changes: BTreeMap<(String, String), u32>,
    warned_missing_fragment_info: bool,
    warned_extra_fragments: bool,
}

impl<S: BamSink> BamLoader<S> {
    pub fn new(opts: BamLoadOptions, sink: S, legacy_key_index: bool) -> Result<BamLoader<S>> {
        let arena = ArenaTable::create(&opts.tmp_dir)?;
        let frags = FragmentBank::create(&opts.tmp_dir, opts.cache_size)?;
        let keys = KeyIndex::new(&opts.tmp_dir, opts.cache_size as usize, legacy_key_index);
        let ref_tracker = RefTracker::new(opts.max_seq_len, opts.require_sorted, opts.expect_unsorted);
        Ok(BamLoader {
            opts,
            sink,
            keys,
            arena,
            frags,
            ref_tracker,
            rg_platforms: BTreeMap::new(),
            spot_id: 0,
            primary_id: 0,
            secondary_id: 0,
            align_count: 0,
            records_read: 0,
            records_processed: 0,
            err_count: 0,
            color_space: ColorSpaceState::Unknown,
            seq_row_keys: Vec::new(),
            align_row_keys: Vec::new(),
            changes: BTreeMap::new(),
            warned_missing_fragment_info: false,
            warned_extra_fragments: false,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn ref_tracker(&self) -> &RefTracker {
        &self.ref_tracker
    }

    pub fn set_references(&mut self, refs: Vec<(String, u64)>) {
        self.ref_tracker.set_references(refs);
    }

    pub fn set_read_groups(&mut self, groups: BTreeMap<String, Platform>) {
        self.rg_platforms = groups;
    }

    pub fn spots_written(&self) -> i64 {
        self.spot_id
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed
    }

    pub fn alignments_written(&self) -> u64 {
        self.align_count
    }

    fn platform_of(&self, spot_group: &str) -> Platform {
        self.rg_platforms.get(spot_group).copied().unwrap_or(Platform::Undefined)
    }

    /// Process one decoded record through the key index, the arena and the
    /// fragment bank.
    pub fn process_record(&mut self, rec: BamRecordView) -> Result<()> {
        self.records_read += 1;

        // color space and base space cannot mix in one run
        match (self.color_space, rec.has_color_space) {
            (ColorSpaceState::Unknown, true) => self.color_space = ColorSpaceState::ColorSpace,
            (ColorSpaceState::Unknown, false) => self.color_space = ColorSpaceState::BaseSpace,
            (ColorSpaceState::BaseSpace, true) | (ColorSpaceState::ColorSpace, false) => {
                return Err(LoaderError::runtime(
                    "File contains base space and color space reads",
                ));
            }
            _ => {}
        }
        let is_color_space = self.color_space == ColorSpaceState::ColorSpace;

        let mut is_primary = !rec.is_secondary();
        if self.opts.no_secondary && !is_primary {
            record_change(&mut self.changes, "discarded", "secondary alignment");
            return Ok(());
        }
        let originally_aligned = !rec.is_unmapped();
        let mut aligned = originally_aligned;
        if aligned && rec.mapq < self.opts.min_map_qual {
            aligned = false;
            record_change(&mut self.changes, "unaligned", "low mapping quality");
        }
        if aligned {
            if rec.tid < 0 {
                log::warn!("A spot was marked aligned, but its reference id is invalid");
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "unaligned", "invalid reference");
                aligned = false;
            } else if rec.pos < 0 {
                log::warn!("A spot was marked aligned, but its reference position is invalid");
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "unaligned", "invalid reference position");
                aligned = false;
            } else if !self.ref_tracker.is_known(rec.tid) {
                log::warn!("A spot refers to an unknown reference number {}", rec.tid);
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "discarded", "unknown reference");
                return Ok(());
            }
        }

        let (key_id, was_inserted) = self.keys.get_key_id(&rec.spot_group, &rec.qname)?;

        // read number and matedness from the wire flags
        let mut mated = false;
        let mut readno = 1u8;
        if rec.is_paired() {
            let mut r = 0u8;
            if rec.flags & FLAG_FIRST != 0 {
                r |= 1;
            }
            if rec.flags & FLAG_SECOND != 0 {
                r |= 2;
            }
            match r {
                1 | 2 => {
                    readno = r;
                    mated = true;
                }
                0 => {
                    if !self.warned_missing_fragment_info {
                        log::warn!("Spots without fragment info have been encountered");
                        self.warned_missing_fragment_info = true;
                    }
                    record_change(&mut self.changes, "fragment", "missing fragment info");
                }
                _ => {
                    if !self.warned_extra_fragments {
                        log::warn!("Spots with more than two fragments have been encountered");
                        self.warned_extra_fragments = true;
                    }
                    record_change(&mut self.changes, "fragment", "more than two fragments");
                }
            }
        }
        let ridx = (readno - 1).min(1) as usize;

        let platform = self.platform_of(&rec.spot_group);
        let state = self.arena.state_mut(key_id)?;
        if was_inserted {
            state.set_unmated(!mated);
            state.set_pcr_dup(rec.is_duplicate());
            state.platform = platform as u8;
        } else {
            let old_dup = state.pcr_dup();
            let new_dup = rec.is_duplicate();
            if !self.opts.accept_bad_dups && old_dup != new_dup {
                log::warn!("Spot has inconsistent PCR duplicate flags");
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "discarded", "inconsistent PCR duplicate flag");
                return Ok(());
            }
            state.set_pcr_dup(old_dup & new_dup);
            if old_dup != (old_dup & new_dup) {
                record_change(&mut self.changes, "flags", "PCR duplicate flag cleared");
            }
            if mated && state.unmated() {
                log::warn!("Spot first seen without mate info now has mate info");
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "discarded", "inconsistent fragment info");
                return Ok(());
            }
            if !mated && !state.unmated() {
                log::warn!("Spot first seen with mate info now has no mate info");
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                record_change(&mut self.changes, "discarded", "inconsistent fragment info");
                return Ok(());
            }
        }
        self.records_processed += 1;

        if is_primary {
            if state.primary_id(ridx) != 0 {
                is_primary = false;
                record_change(&mut self.changes, "flags", "duplicate primary demoted to secondary");
            } else if aligned && state.unaligned(ridx) {
                log::warn!(
                    "Read {} of a spot that was unmapped is now mapped; treating the alignment as secondary",
                    readno
                );
                is_primary = false;
                record_change(&mut self.changes, "flags", "previously unaligned read mapped");
            }
        }

        if aligned && is_primary {
            self.ref_tracker.observe(rec.tid, rec.pos as u64)?;
        }
        if !aligned && is_primary && mated {
            state.set_unaligned(ridx, true);
        }

        let mut align_id = 0i64;
        if is_primary && aligned && state.primary_id(ridx) == 0 {
            self.primary_id += 1;
            align_id = self.primary_id;
            state.set_primary_id(ridx, align_id);
        }

        // store reads in biological orientation
        let revcmp = rec.is_reverse() && !(is_color_space && !aligned);
        let (sequence, quality) = if revcmp {
            record_change(&mut self.changes, "sequence", "reverse complemented");
            record_change(&mut self.changes, "quality", "reversed");
            (reverse_complement(&rec.sequence), rec.quality.iter().rev().copied().collect())
        } else {
            (rec.sequence.clone(), rec.quality.clone())
        };

        if mated {
            if is_primary || !originally_aligned {
                if state.spot_id() != 0 {
                    log::warn!("Spot has already been assigned a spot id");
                } else if !state.has_a_read() {
                    // first half of the pair: bank it
                    let near = aligned && rec.mtid == rec.tid && rec.mpos > 0 && rec.mpos != rec.pos;
                    let blob = FragmentBlob {
                        info: FragmentInfo {
                            ti: rec.ti,
                            read_len: sequence.len() as u32,
                            aligned,
                            is_bad: rec.is_qc_fail(),
                            orientation: rec.is_reverse() as u8,
                            other_read_no: readno,
                            cs_key: rec.cs_key,
                        },
                        sequence: sequence.clone().into_bytes(),
                        quality: quality.clone(),
                        spot_group: rec.spot_group.clone().into_bytes(),
                    };
                    let bytes = blob.to_bytes();
                    let id = self.frags.alloc(bytes.len() as u32, near)?;
                    self.frags.write(id, &bytes)?;
                    state.fragment_id = id;
                    state.set_has_a_read(true);
                } else if state.fragment_id != 0 {
                    let bytes = self.frags.read(state.fragment_id)?;
                    let blob = FragmentBlob::from_bytes(&bytes)?;
                    if blob.info.other_read_no != readno {
                        // mate found: emit both reads in read-number order
                        let banked = SeqRead {
                            sequence: String::from_utf8_lossy(&blob.sequence).into_owned(),
                            quality: blob.quality.clone(),
                            aligned: blob.info.aligned,
                            is_bad: blob.info.is_bad,
                            orientation: blob.info.orientation,
                            ti: blob.info.ti,
                            cs_key: blob.info.cs_key,
                        };
                        let live = SeqRead {
                            sequence,
                            quality,
                            aligned,
                            is_bad: rec.is_qc_fail(),
                            orientation: rec.is_reverse() as u8,
                            ti: rec.ti,
                            cs_key: rec.cs_key,
                        };
                        let reads = if blob.info.other_read_no < readno {
                            vec![banked, live]
                        } else {
                            vec![live, banked]
                        };
                        if state.pcr_dup() && reads.iter().any(|r| r.is_bad) {
                            log::warn!(
                                "Spot has both 0x400 and 0x200 flag bits set, only 0x400 will be saved"
                            );
                            record_change(&mut self.changes, "flags", "quality-fail dropped for duplicate");
                        }
                        let spot = SequenceSpot {
                            key_id,
                            reads,
                            spot_group: rec.spot_group.clone(),
                            platform: state.platform,
                            pcr_dup: state.pcr_dup(),
                            is_color_space,
                        };
                        self.sink.write_sequence(&spot)?;
                        self.seq_row_keys.push(key_id);
                        self.spot_id += 1;
                        state.set_spot_id(self.spot_id);
                        self.frags.free(state.fragment_id)?;
                        state.fragment_id = 0;
                    }
                }
            }
        } else if state.spot_id() == 0 && (is_primary || !originally_aligned) {
            // unmated: the spot is complete with this one read
            let spot = SequenceSpot {
                key_id,
                reads: vec![SeqRead {
                    sequence,
                    quality,
                    aligned,
                    is_bad: rec.is_qc_fail(),
                    orientation: rec.is_reverse() as u8,
                    ti: rec.ti,
                    cs_key: rec.cs_key,
                }],
                spot_group: rec.spot_group.clone(),
                platform: state.platform,
                pcr_dup: state.pcr_dup(),
                is_color_space,
            };
            self.sink.write_sequence(&spot)?;
            self.seq_row_keys.push(key_id);
            self.spot_id += 1;
            state.set_spot_id(self.spot_id);
            state.fragment_id = 0;
        }

        if aligned {
            state.bump_alignment_count(ridx);
            self.align_count += 1;
            if !is_primary {
                self.secondary_id += 1;
                align_id = self.secondary_id;
            }
            let row = AlignmentRow {
                align_id,
                key_id,
                is_primary,
                ref_id: rec.tid,
                pos: rec.pos,
                mapq: rec.mapq,
                read_no: readno,
                reverse: rec.is_reverse(),
                mate_reverse: rec.flags & FLAG_MATE_REVERSE != 0,
                mate_ref_id: rec.mtid,
                mate_pos: rec.mpos,
                template_len: rec.tlen,
            };
            self.sink.write_alignment(&row)?;
            self.align_row_keys.push(key_id);
        }
        Ok(())
    }

    /// Emit every banked fragment whose mate never arrived.
    pub fn write_solo_fragments(&mut self) -> Result<()> {
        log::info!("Writing unpaired sequences");
        let partitions = if self.keys.is_legacy() { 1 } else { self.keys.tree_count() };
        let total: u64 = (0..partitions).map(|p| self.keys.id_count(p) as u64).sum();
        let progress = indicatif::ProgressBar::new(total);
        for partition in 0..partitions {
            for i in 0..self.keys.id_count(partition) {
                progress.inc(1);
                let key_id = ((partition as u64) << 32) | i as u64;
                let state = self.arena.state_mut(key_id)?;
                if state.fragment_id == 0 {
                    continue;
                }
                let bytes = self.frags.read(state.fragment_id)?;
                let blob = FragmentBlob::from_bytes(&bytes)?;
                // mated spots keep two read slots; the missing mate is empty
                let read_slot = if !state.unmated()
                    && ((blob.info.aligned && state.primary_id(0) == 0) || state.unaligned(1))
                {
                    1
                } else {
                    0
                };
                let banked = SeqRead {
                    sequence: String::from_utf8_lossy(&blob.sequence).into_owned(),
                    quality: blob.quality.clone(),
                    aligned: blob.info.aligned,
                    is_bad: blob.info.is_bad,
                    orientation: blob.info.orientation,
                    ti: blob.info.ti,
                    cs_key: blob.info.cs_key,
                };
                let mut reads = if state.unmated() {
                    vec![SeqRead::default()]
                } else {
                    vec![SeqRead::default(), SeqRead::default()]
                };
                reads[read_slot] = banked;
                let spot = SequenceSpot {
                    key_id,
                    reads,
                    spot_group: String::from_utf8_lossy(&blob.spot_group).into_owned(),
                    platform: state.platform,
                    pcr_dup: state.pcr_dup(),
                    is_color_space: self.color_space == ColorSpaceState::ColorSpace,
                };
                self.sink.write_sequence(&spot)?;
                self.seq_row_keys.push(key_id);
                self.spot_id += 1;
                state.set_spot_id(self.spot_id);
            }
        }
        progress.finish_and_clear();
        Ok(())
    }

    /// Push final primary-alignment ids and counts back onto the sequence
    /// rows.
    pub fn update_sequence_align_info(&mut self) -> Result<()> {
        log::info!("Updating sequence alignment info");
        for (row0, key_id) in self.seq_row_keys.iter().enumerate() {
            let row = row0 as u64 + 1;
            let state = self.arena.state(*key_id)?;
            if state.spot_id() != row as i64 {
                return Err(LoaderError::runtime(format!(
                    "Unexpected spot id {} for row {}, index {}",
                    state.spot_id(),
                    row,
                    key_id
                )));
            }
            self.sink.update_sequence(
                row,
                [state.primary_id(0), state.primary_id(1)],
                [state.alignment_count(0), state.alignment_count(1)],
            )?;
        }
        Ok(())
    }

    /// Rewrite alignment rows with the final spot ids from the arena.
    pub fn update_alignment_spot_ids(&mut self) -> Result<()> {
        log::info!("Writing alignment spot ids");
        for (row0, key_id) in self.align_row_keys.iter().enumerate() {
            let state = self.arena.state(*key_id)?;
            let spot_id = state.spot_id();
            if spot_id == 0 {
                log::warn!(
                    "Spot {:x} was never assigned a spot id, probably has no primary alignments",
                    key_id
                );
            }
            self.sink.assign_alignment_spot(row0 as u64 + 1, spot_id)?;
        }
        Ok(())
    }

    /// Solo sweep, coverage flush, both update passes, change-counter
    /// metadata.
    pub fn finish(&mut self) -> Result<()> {
        if self.records_processed == 0 {
            return Err(LoaderError::runtime(
                "The file contained no records that were processed.",
            ));
        }
        self.write_solo_fragments()?;
        self.ref_tracker.flush(&mut self.sink)?;
        self.update_sequence_align_info()?;
        self.update_alignment_spot_ids()?;
        for (n, ((change, reason), count)) in self.changes.iter().enumerate() {
            let key = format!("CHANGES/{}_{}", change, n + 1);
            let be: String = count.to_be_bytes().iter().map(|b| format!("{:02x}", b)).collect();
            self.sink.set_metadata(&key, &be)?;
            self.sink.set_metadata(&format!("{}@change", key), change)?;
            self.sink.set_metadata(&format!("{}@reason", key), reason)?;
        }
        log::info!(
            "records: {}, processed: {}, spots: {}, alignments: {}",
            self.records_read,
            self.records_processed,
            self.spot_id,
            self.align_count
        );
        Ok(())
    }

    /// Decode and process one BAM file via the external decoder.
    pub fn process_file(&mut self, path: &Path) -> Result<()> {
        use rust_htslib::bam::record::Aux;
        use rust_htslib::bam::{Read as BamRead, Reader};

        let mut reader = Reader::from_path(path).map_err(|e| {
            LoaderError::new(40, format!("File '{}' does not exist: {}", path.display(), e))
        })?;
        let (header_text, refs) = {
            let header = reader.header();
            let text = rust_htslib::bam::Header::from_template(header).to_bytes();
            let mut refs = Vec::with_capacity(header.target_count() as usize);
            for tid in 0..header.target_count() {
                let name = String::from_utf8_lossy(header.tid2name(tid)).into_owned();
                let length = header.target_len(tid).unwrap_or(0);
                refs.push((name, length));
            }
            (text, refs)
        };
        self.set_references(refs);
        self.set_read_groups(parse_read_groups(&header_text));
        self.sink.set_metadata("BAM_HEADER", &String::from_utf8_lossy(&header_text))?;

        log::info!("Loading '{}'", path.display());
        let progress = indicatif::ProgressBar::new_spinner()
            .with_message(path.display().to_string());
        let mut record = rust_htslib::bam::Record::new();
        while let Some(result) = reader.read(&mut record) {
            if self.records_read % 1_000_000 == 0 {
                progress.set_position(self.records_read);
            }
            if let Err(e) = result {
                log::warn!("Bad record in '{}': {}", path.display(), e);
                bump_error(&mut self.err_count, self.opts.max_err_count)?;
                continue;
            }
            let spot_group = match record.aux(b"RG") {
                Ok(Aux::String(s)) => s.to_string(),
                _ => String::new(),
            };
            let ti = match record.aux(b"TI") {
                Ok(Aux::U32(v)) => v as u64,
                Ok(Aux::U16(v)) => v as u64,
                Ok(Aux::U8(v)) => v as u64,
                Ok(Aux::I32(v)) => v as u64,
                _ => 0,
            };
            let has_color_space = record.aux(b"CS").is_ok();
            let cs_key = match record.aux(b"CQ") {
                Ok(Aux::Char(c)) => c,
                _ => 0,
            };
            let view = BamRecordView {
                qname: record.qname().to_vec(),
                flags: record.flags(),
                spot_group,
                mapq: record.mapq(),
                tid: record.tid(),
                pos: record.pos(),
                mtid: record.mtid(),
                mpos: record.mpos(),
                tlen: record.insert_size(),
                sequence: String::from_utf8_lossy(&record.seq().as_bytes()).into_owned(),
                quality: record.qual().to_vec(),
                ti,
                has_color_space,
                cs_key,
            };
            self.process_record(view)?;
        }
        progress.finish_and_clear();
        Ok(())
    }
}

/// Read groups and their platforms from the header text.
fn parse_read_groups(header_text: &[u8]) -> BTreeMap<String, Platform> {
    let mut groups = BTreeMap::new();
    let text = String::from_utf8_lossy(header_text);
    for line in text.lines() {
        if !line.starts_with("@RG") {
            continue;
        }
        let mut id = None;
        let mut platform = Platform::Undefined;
        for field in line.split('\t') {
            if let Some(value) = field.strip_prefix("ID:") {
                id = Some(value.to_string());
            } else if let Some(value) = field.strip_prefix("PL:") {
                platform = match value.to_ascii_uppercase().as_str() {
                    "ILLUMINA" => Platform::Illumina,
                    "LS454" | "454" => Platform::Ls454,
                    "PACBIO" => Platform::PacBio,
                    "IONTORRENT" | "ION_TORRENT" => Platform::IonTorrent,
                    "ONT" | "NANOPORE" | "OXFORD_NANOPORE" => Platform::OxfordNanopore,
                    "CAPILLARY" => Platform::Capillary,
                    "HELICOS" => Platform::Helicos,
                    "ABI_SOLID" | "SOLID" => Platform::AbSolid,
                    "COMPLETE_GENOMICS" => Platform::CompleteGenomics,
                    _ => Platform::Undefined,
                };
            }
        }
        if let Some(id) = id {
            groups.insert(id, platform);
        }
    }
    groups
}

/// Count read groups in the header text; above the partition count the key
/// index drops to its legacy single-tree mode.
pub fn read_group_count(header_text: &[u8]) -> usize {
    String::from_utf8_lossy(header_text)
        .lines()
        .filter(|l| l.starts_with("@RG"))
        .count()
}

/// Read-group count of a BAM file's header, without processing records.
pub fn peek_read_group_count(path: &Path) -> Result<usize> {
    use rust_htslib::bam::Read as BamRead;
    let reader = rust_htslib::bam::Reader::from_path(path).map_err(|e| {
        LoaderError::new(40, format!("File '{}' does not exist: {}", path.display(), e))
    })?;
    let text = rust_htslib::bam::Header::from_template(reader.header()).to_bytes();
    Ok(read_group_count(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> BamLoader<MemoryBamSink> {
        let opts = BamLoadOptions {
            tmp_dir: std::env::temp_dir(),
            cache_size: 1 << 20,
            ..BamLoadOptions::default()
        };
        let mut loader = BamLoader::new(opts, MemoryBamSink::default(), false).unwrap();
        loader.set_references(vec![("chr1".to_string(), 100_000), ("chr2".to_string(), 50_000)]);
        loader
    }

    fn unmated(name: &str, seq: &str, tid: i32, pos: i64, mapq: u8) -> BamRecordView {
        BamRecordView {
            qname: name.as_bytes().to_vec(),
            flags: 0,
            mapq,
            tid,
            pos,
            mtid: -1,
            mpos: -1,
            sequence: seq.to_string(),
            quality: vec![30; seq.len()],
            ..BamRecordView::default()
        }
    }

    fn mate(name: &str, seq: &str, readno: u8, tid: i32, pos: i64, mtid: i32, mpos: i64) -> BamRecordView {
        let mut flags = FLAG_PAIRED;
        flags |= if readno == 1 { FLAG_FIRST } else { FLAG_SECOND };
        BamRecordView {
            qname: name.as_bytes().to_vec(),
            flags,
            mapq: 60,
            tid,
            pos,
            mtid,
            mpos,
            sequence: seq.to_string(),
            quality: vec![30; seq.len()],
            ..BamRecordView::default()
        }
    }

    #[test]
    fn test_unmated_read_emits_spot_immediately() {
        let mut l = loader();
        l.process_record(unmated("solo", "GATTACA", 0, 100, 60)).unwrap();
        assert_eq!(l.sink().sequences.len(), 1);
        let spot = &l.sink().sequences[0];
        assert_eq!(spot.reads.len(), 1);
        assert_eq!(spot.reads[0].sequence, "GATTACA");
        assert_eq!(l.spots_written(), 1);
        // one aligned row with a provisional spot id
        assert_eq!(l.sink().alignments.len(), 1);
        assert_eq!(l.sink().alignments[0].align_id, 1);
    }

    #[test]
    fn test_mate_pair_assembles_in_read_order() {
        let mut l = loader();
        // read 2 arrives first and is banked
        l.process_record(mate("pair", "TTTT", 2, 0, 500, 0, 100)).unwrap();
        assert_eq!(l.sink().sequences.len(), 0);
        l.process_record(mate("pair", "AAAA", 1, 0, 600, 0, 500)).unwrap();
        assert_eq!(l.sink().sequences.len(), 1);
        let spot = &l.sink().sequences[0];
        assert_eq!(spot.reads.len(), 2);
        // canonical order: read 1 first even though it arrived second
        assert_eq!(spot.reads[0].sequence, "AAAA");
        assert_eq!(spot.reads[1].sequence, "TTTT");
        assert_eq!(l.spots_written(), 1);
    }

    #[test]
    fn test_reverse_strand_is_reverse_complemented() {
        let mut l = loader();
        let mut rec = unmated("rev", "AACG", 0, 10, 60);
        rec.flags |= FLAG_REVERSE;
        l.process_record(rec).unwrap();
        assert_eq!(l.sink().sequences[0].reads[0].sequence, "CGTT");
    }

    #[test]
    fn test_low_mapq_drops_to_unaligned() {
        let opts = BamLoadOptions {
            tmp_dir: std::env::temp_dir(),
            min_map_qual: 10,
            ..BamLoadOptions::default()
        };
        let mut l = BamLoader::new(opts, MemoryBamSink::default(), false).unwrap();
        l.set_references(vec![("chr1".to_string(), 100_000)]);
        l.process_record(unmated("lowq", "ACGT", 0, 10, 3)).unwrap();
        // the spot is still written, but no alignment row
        assert_eq!(l.sink().sequences.len(), 1);
        assert!(!l.sink().sequences[0].reads[0].aligned);
        assert_eq!(l.sink().alignments.len(), 0);
    }

    #[test]
    fn test_pcr_dup_conflict_discards_record() {
        let mut l = loader();
        l.process_record(mate("pair", "AAAA", 1, 0, 100, 0, 200)).unwrap();
        let mut second = mate("pair", "TTTT", 2, 0, 200, 0, 100);
        second.flags |= FLAG_DUPLICATE;
        l.process_record(second).unwrap();
        // the conflicting mate was discarded, so the spot never assembled
        assert_eq!(l.sink().sequences.len(), 0);
        assert_eq!(
            l.changes.get(&(
                "discarded".to_string(),
                "inconsistent PCR duplicate flag".to_string()
            )),
            Some(&1)
        );
    }

    #[test]
    fn test_solo_fragment_sweep() {
        let mut l = loader();
        l.process_record(mate("lonely", "GGGG", 1, 0, 100, 0, 900)).unwrap();
        assert_eq!(l.sink().sequences.len(), 0);
        l.write_solo_fragments().unwrap();
        assert_eq!(l.sink().sequences.len(), 1);
        let spot = &l.sink().sequences[0];
        assert_eq!(spot.reads.len(), 2);
        assert_eq!(spot.reads[0].sequence, "GGGG");
        assert_eq!(spot.reads[1].sequence, "");
    }

    #[test]
    fn test_alignment_rewrite_pass_assigns_final_spot_ids() {
        let mut l = loader();
        l.process_record(mate("p", "AAAA", 1, 0, 100, 0, 200)).unwrap();
        l.process_record(mate("p", "TTTT", 2, 0, 200, 0, 100)).unwrap();
        l.finish().unwrap();
        // both alignment rows resolve to spot 1
        assert_eq!(l.sink().alignment_spots, vec![(1, 1), (2, 1)]);
        // the sequence row received its primary ids and counts; read 2 was
        // processed first, so it holds primary alignment id 1
        assert_eq!(l.sink().sequence_updates.len(), 1);
        let (row, primary, counts) = l.sink().sequence_updates[0];
        assert_eq!(row, 1);
        assert_eq!(primary, [2, 1]);
        assert_eq!(counts, [1, 1]);
    }

    #[test]
    fn test_unsorted_input_switches_mode() {
        let mut l = loader();
        l.process_record(unmated("a", "ACGT", 0, 1000, 60)).unwrap();
        l.process_record(unmated("b", "ACGT", 0, 500, 60)).unwrap();
        assert!(l.ref_tracker().is_unsorted());
    }

    #[test]
    fn test_unsorted_input_fatal_when_required() {
        let opts = BamLoadOptions {
            tmp_dir: std::env::temp_dir(),
            require_sorted: true,
            ..BamLoadOptions::default()
        };
        let mut l = BamLoader::new(opts, MemoryBamSink::default(), false).unwrap();
        l.set_references(vec![("chr1".to_string(), 100_000)]);
        l.process_record(unmated("a", "ACGT", 0, 1000, 60)).unwrap();
        let e = l.process_record(unmated("b", "ACGT", 0, 500, 60)).unwrap_err();
        assert!(e.message().contains("unsorted"));
    }

    #[test]
    fn test_color_space_mixing_is_fatal() {
        let mut l = loader();
        l.process_record(unmated("a", "ACGT", 0, 10, 60)).unwrap();
        let mut cs = unmated("b", "ACGT", 0, 20, 60);
        cs.has_color_space = true;
        assert!(l.process_record(cs).is_err());
    }

    #[test]
    fn test_coverage_chunks_ascend() {
        let mut l = loader();
        for pos in [100, 4000, 6000, 12_000] {
            let name = format!("r{}", pos);
            l.process_record(unmated(&name, "ACGT", 0, pos, 60)).unwrap();
        }
        l.finish().unwrap();
        let chunks: Vec<u64> = l.sink().coverage.iter().map(|(_, c, _)| *c).collect();
        assert_eq!(chunks, vec![0, 5000, 10_000]);
        let depths: Vec<u64> = l.sink().coverage.iter().map(|(_, _, d)| *d).collect();
        assert_eq!(depths, vec![2, 1, 1]);
    }

    #[test]
    fn test_parse_read_groups() {
        let header = b"@HD\tVN:1.6\tSO:coordinate\n@RG\tID:rg1\tPL:ILLUMINA\n@RG\tID:rg2\tPL:PACBIO\n";
        let groups = parse_read_groups(header);
        assert_eq!(groups.get("rg1"), Some(&Platform::Illumina));
        assert_eq!(groups.get("rg2"), Some(&Platform::PacBio));
        assert_eq!(read_group_count(header), 2);
    }
}
