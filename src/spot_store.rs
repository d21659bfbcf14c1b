//! Hot/cold storage for partially assembled spots during the second pass.
//!
//! Spots whose reads sit close together in the stream are buffered whole in
//! a hash map; spots whose mates are millions of rows apart go to per-slot
//! columns: 3-bit DNA codes and delta-encoded quality scores in sparse
//! vectors, addressed by `(len << 48) | offset` locators stored per spot
//! row. Cleared rows accumulate and are released in large batches.

use std::sync::Mutex;

use bitvec::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{LoaderError, Result};
use crate::read::Read;
use crate::sparse::SparseVec;

const MAX_ROWS_TO_CLEAR: usize = 5_000_000;
const MAX_ROWS_TO_OPTIMIZE: usize = 10_000_000;
const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const OFFSET_LIMIT: u64 = 1 << 48;

fn dna_to_code(base: u8) -> Result<u8> {
    Ok(match base {
        b'A' => 0,
        b'T' => 1,
        b'G' => 2,
        b'C' => 3,
        b'N' => 4,
        other => {
            return Err(LoaderError::runtime(format!("Invalid DNA base: {}", other as char)))
        }
    })
}

fn code_to_dna(code: u8) -> u8 {
    match code {
        0 => b'A',
        1 => b'T',
        2 => b'G',
        3 => b'C',
        _ => b'N',
    }
}

/// Columns for one read slot (slot k holds the k-th stored read of every
/// cold spot).
#[derive(Default)]
struct SlotColumns {
    read_num: FxHashMap<u32, Box<str>>,
    spot_group: FxHashMap<u32, Box<str>>,
    suffix: FxHashMap<u32, Box<str>>,
    channel: FxHashMap<u32, Box<str>>,
    nanopore_no: FxHashMap<u32, Box<str>>,
    read_filter: FxHashMap<u32, u8>,
    reader_id: SparseVec<u16>,
    seq_loc: SparseVec<u64>,
    qual_loc: SparseVec<u64>,
    sequences: SparseVec<u8>,
    qualities: SparseVec<i16>,
    seq_offset: u64,
    qual_offset: u64,
}

#[derive(Default)]
struct ColdStore {
    slots: Vec<SlotColumns>,
    /// reads currently stored per spot id.
    spot_index: SparseVec<u8>,
    rows_to_clear: BitVec<u64, Lsb0>,
    num_rows_to_clear: usize,
    rows_to_optimize: usize,
}

pub struct SpotStore {
    hot: Mutex<FxHashMap<u32, Vec<Read>>>,
    cold: Mutex<ColdStore>,
    mid_score: i16,
}

impl SpotStore {
    pub fn new(max_reads: usize, mid_score: i16) -> Self {
        let mut cold = ColdStore::default();
        cold.slots.resize_with(max_reads.max(1), SlotColumns::default);
        SpotStore {
            hot: Mutex::new(FxHashMap::default()),
            cold: Mutex::new(cold),
            mid_score,
        }
    }

    pub fn hot_len(&self) -> usize {
        self.hot.lock().unwrap().len()
    }

    /// Store one read of a spot that is not yet complete.
    pub fn save_read(&self, spot_id: u32, read: Read, is_hot: bool) -> Result<()> {
        if is_hot {
            self.hot.lock().unwrap().entry(spot_id).or_default().push(read);
            return Ok(());
        }

        // encode outside the store lock
        let seq = read.sequence().as_bytes();
        let mut seq_codes = Vec::with_capacity(seq.len());
        for &b in seq {
            seq_codes.push(dna_to_code(b)?);
        }
        let scores = read.qual_scores();
        debug_assert_eq!(scores.len(), seq.len());
        let mut deltas = Vec::with_capacity(scores.len());
        let mut prev = self.mid_score;
        for &score in &scores {
            deltas.push(score - prev);
            prev = score;
        }

        let mut guard = self.cold.lock().unwrap();
        let cold = &mut *guard;
        let read_idx = cold.spot_index.get(spot_id as u64) as usize;
        if read_idx >= cold.slots.len() {
            cold.slots.resize_with(read_idx + 1, SlotColumns::default);
        }
        let slot = &mut cold.slots[read_idx];

        slot.reader_id.set(spot_id as u64, read.reader_idx);
        if !read.read_num().is_empty() {
            slot.read_num.insert(spot_id, read.read_num().into());
        }
        if !read.spot_group().is_empty() {
            slot.spot_group.insert(spot_id, read.spot_group().into());
        }
        if !read.suffix().is_empty() {
            slot.suffix.insert(spot_id, read.suffix().into());
        }
        if !read.channel().is_empty() {
            slot.channel.insert(spot_id, read.channel().into());
        }
        if !read.nanopore_read_no().is_empty() {
            slot.nanopore_no.insert(spot_id, read.nanopore_read_no().into());
        }
        if read.read_filter() != 0 {
            slot.read_filter.insert(spot_id, read.read_filter());
        }

        let len = seq_codes.len() as u64;
        let offset = slot.seq_offset;
        if offset + len >= OFFSET_LIMIT {
            return Err(LoaderError::runtime(
                "This FASTQ cannot be processed due to far read buffer overflow",
            ));
        }
        slot.sequences.import(&seq_codes, offset);
        slot.seq_offset = offset + len;
        slot.seq_loc.set(spot_id as u64, (len << 48) | offset);

        let qual_offset = slot.qual_offset;
        slot.qualities.import(&deltas, qual_offset);
        slot.qual_offset = qual_offset + len;
        slot.qual_loc.set(spot_id as u64, (len << 48) | qual_offset);

        cold.spot_index.set(spot_id as u64, read_idx as u8 + 1);
        cold.rows_to_optimize += 1;
        Ok(())
    }

    /// Retrieve every stored read of a spot; hot spots are taken out of the
    /// map, cold spots are decoded from the columns.
    pub fn get_spot(&self, spot_id: u32, is_hot: bool) -> Vec<Read> {
        if is_hot {
            return self.hot.lock().unwrap().remove(&spot_id).unwrap_or_default();
        }
        let cold = self.cold.lock().unwrap();
        let num_reads = cold.spot_index.get(spot_id as u64) as usize;
        let mut reads = Vec::with_capacity(num_reads);
        for read_idx in 0..num_reads {
            let slot = &cold.slots[read_idx];
            let mut read = Read::default();
            read.reader_idx = slot.reader_id.get(spot_id as u64);
            if let Some(v) = slot.read_num.get(&spot_id) {
                read.set_read_num(v.as_ref());
            }
            if let Some(v) = slot.spot_group.get(&spot_id) {
                read.set_spot_group(v.as_ref());
            }
            if let Some(v) = slot.suffix.get(&spot_id) {
                read.set_suffix(v.as_ref());
            }
            if let Some(v) = slot.channel.get(&spot_id) {
                read.set_channel(v.as_ref());
            }
            if let Some(v) = slot.nanopore_no.get(&spot_id) {
                read.set_nanopore_read_no(v.as_ref());
            }
            if let Some(&v) = slot.read_filter.get(&spot_id) {
                read.set_read_filter(v);
            }

            let loc = slot.seq_loc.get(spot_id as u64);
            let len = (loc >> 48) as usize;
            let offset = loc & OFFSET_MASK;
            let mut codes = vec![0u8; len];
            slot.sequences.decode(&mut codes, offset);
            let seq: String = codes.iter().map(|&c| code_to_dna(c) as char).collect();
            read.set_sequence(seq);

            let loc = slot.qual_loc.get(spot_id as u64);
            let len = (loc >> 48) as usize;
            let offset = loc & OFFSET_MASK;
            let mut deltas = vec![0i16; len];
            slot.qualities.decode(&mut deltas, offset);
            let mut scores = Vec::with_capacity(len);
            let mut prev = self.mid_score;
            for delta in deltas {
                prev += delta;
                scores.push(prev);
            }
            read.set_qual_scores(scores);
            reads.push(read);
        }
        reads
    }

    /// Mark a spot's storage reclaimable. Cold rows are batched and freed
    /// together.
    pub fn clear_spot(&self, spot_id: u32, is_hot: bool) {
        if is_hot {
            self.hot.lock().unwrap().remove(&spot_id);
            return;
        }
        let mut cold = self.cold.lock().unwrap();
        let idx = spot_id as usize;
        if cold.rows_to_clear.len() <= idx {
            cold.rows_to_clear.resize(idx + 1, false);
        }
        cold.rows_to_clear.set(idx, true);
        cold.num_rows_to_clear += 1;
        if cold.num_rows_to_clear >= MAX_ROWS_TO_CLEAR {
            Self::flush_clears(&mut cold);
        }
    }

    /// Force the pending clear batch through; called at end of run.
    pub fn flush_pending_clears(&self) {
        let mut cold = self.cold.lock().unwrap();
        if cold.num_rows_to_clear > 0 {
            Self::flush_clears(&mut cold);
        }
    }

    fn flush_clears(cold: &mut ColdStore) {
        let rows: Vec<u32> = cold.rows_to_clear.iter_ones().map(|i| i as u32).collect();
        let cleared = rows.len();
        for slot in &mut cold.slots {
            for &row in &rows {
                let loc = slot.seq_loc.get(row as u64);
                let len = loc >> 48;
                if len > 0 {
                    let offset = loc & OFFSET_MASK;
                    slot.sequences.clear_range(offset, offset + len - 1);
                }
                let loc = slot.qual_loc.get(row as u64);
                let len = loc >> 48;
                if len > 0 {
                    let offset = loc & OFFSET_MASK;
                    slot.qualities.clear_range(offset, offset + len - 1);
                }
                slot.seq_loc.set(row as u64, 0);
                slot.qual_loc.set(row as u64, 0);
                slot.reader_id.set(row as u64, 0);
                slot.read_num.remove(&row);
                slot.spot_group.remove(&row);
                slot.suffix.remove(&row);
                slot.channel.remove(&row);
                slot.nanopore_no.remove(&row);
                slot.read_filter.remove(&row);
            }
        }
        for &row in &rows {
            cold.spot_index.set(row as u64, 0);
        }
        cold.rows_to_clear.fill(false);
        cold.rows_to_optimize += cleared;
        cold.num_rows_to_clear = 0;
        log::debug!("cleared {} cold rows", cleared);
    }

    /// Compact the sparse columns once enough rows have churned.
    pub fn optimize(&self) {
        let mut cold = self.cold.lock().unwrap();
        if cold.rows_to_optimize < MAX_ROWS_TO_OPTIMIZE {
            return;
        }
        cold.rows_to_optimize = 0;
        let mut memory = 0usize;
        for slot in &mut cold.slots {
            slot.sequences.optimize();
            slot.qualities.optimize();
            slot.seq_loc.optimize();
            slot.qual_loc.optimize();
            slot.reader_id.optimize();
            memory += slot.sequences.memory_used() + slot.qualities.memory_used();
        }
        log::debug!("cold store optimized, payload memory: {}", memory);
    }

    pub fn cold_memory_used(&self) -> usize {
        let cold = self.cold.lock().unwrap();
        cold.slots
            .iter()
            .map(|s| {
                s.sequences.memory_used()
                    + s.qualities.memory_used()
                    + s.seq_loc.memory_used()
                    + s.qual_loc.memory_used()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_read(seq: &str, scores: &[i16], read_num: &str, reader_idx: u16) -> Read {
        let mut read = Read::default();
        read.set_sequence(seq);
        read.set_qual_scores(scores.to_vec());
        read.set_read_num(read_num);
        read.reader_idx = reader_idx;
        read
    }

    #[test]
    fn test_cold_round_trip() {
        let store = SpotStore::new(2, 63);
        let r1 = mk_read("GATTACA", &[40, 40, 38, 35, 35, 40, 33], "1", 0);
        let mut r2 = mk_read("CCGTN", &[33, 34, 35, 36, 37], "2", 1);
        r2.set_spot_group("BC7");
        r2.set_suffix("_suf");
        r2.set_read_filter(1);
        store.save_read(7, r1, false).unwrap();
        store.save_read(7, r2, false).unwrap();

        let reads = store.get_spot(7, false);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].sequence(), "GATTACA");
        assert_eq!(reads[0].qual_scores(), vec![40, 40, 38, 35, 35, 40, 33]);
        assert_eq!(reads[0].read_num(), "1");
        assert_eq!(reads[1].sequence(), "CCGTN");
        assert_eq!(reads[1].qual_scores(), vec![33, 34, 35, 36, 37]);
        assert_eq!(reads[1].spot_group(), "BC7");
        assert_eq!(reads[1].suffix(), "_suf");
        assert_eq!(reads[1].read_filter(), 1);
        assert_eq!(reads[1].reader_idx, 1);
    }

    #[test]
    fn test_hot_spots_bypass_columns() {
        let store = SpotStore::new(2, 63);
        store.save_read(3, mk_read("ACGT", &[40; 4], "1", 0), true).unwrap();
        store.save_read(3, mk_read("TTTT", &[40; 4], "2", 0), true).unwrap();
        assert_eq!(store.hot_len(), 1);
        let reads = store.get_spot(3, true);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].sequence(), "ACGT");
        // taking the spot empties the hot map
        assert_eq!(store.hot_len(), 0);
    }

    #[test]
    fn test_offsets_grow_per_slot() {
        let store = SpotStore::new(1, 63);
        store.save_read(1, mk_read("AAAA", &[40; 4], "", 0), false).unwrap();
        store.save_read(2, mk_read("CCC", &[40; 3], "", 0), false).unwrap();
        let r1 = store.get_spot(1, false);
        let r2 = store.get_spot(2, false);
        assert_eq!(r1[0].sequence(), "AAAA");
        assert_eq!(r2[0].sequence(), "CCC");
    }

    #[test]
    fn test_clear_and_reuse() {
        let store = SpotStore::new(1, 63);
        store.save_read(5, mk_read("ACGT", &[40; 4], "", 0), false).unwrap();
        store.clear_spot(5, false);
        store.flush_pending_clears();
        let reads = store.get_spot(5, false);
        assert!(reads.is_empty());
    }

    #[test]
    fn test_invalid_base_is_rejected() {
        let store = SpotStore::new(1, 63);
        let bad = mk_read("ACQT", &[40; 4], "", 0);
        assert!(store.save_read(1, bad, false).is_err());
    }
}
