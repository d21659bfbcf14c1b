//! Memory-mapped per-spot state table for the BAM path.
//!
//! The index space is 256 partitions x 4096 subchunks x 1M slots, addressed
//! by the composite key `(partition << 32) | counter`. Subchunks are
//! materialized lazily: the backing file is extended and a fresh mapping is
//! added on first touch, then retained until teardown. The backing file is
//! unlinked right after creation so it disappears with the process.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{LoaderError, Result};

pub const NUM_PARTITIONS: usize = 256;
const SUBCHUNK_BITS: u32 = 20;
pub const SUBCHUNK_SLOTS: u64 = 1 << SUBCHUNK_BITS;
const SUBCHUNK_COUNT: usize = 1 << (32 - SUBCHUNK_BITS);

/// Fixed-size per-spot record kept in the arena.
///
/// Alignment ids and the spot id are 40-bit values split into a 32-bit low
/// word and an 8-bit extension. `alignment_count` saturates at 254; 255
/// means "many".
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SpotState {
    primary_id: [u32; 2],
    spot_id: u32,
    pub fragment_id: u32,
    pub platform: u8,
    pid_ext: [u8; 2],
    spot_id_ext: u8,
    alignment_count: [u8; 2],
    flags: u8,
}

const FLAG_UNMATED: u8 = 1 << 0;
const FLAG_PCR_DUP: u8 = 1 << 1;
const FLAG_HAS_A_READ: u8 = 1 << 2;
const FLAG_UNALIGNED_1: u8 = 1 << 3;
const FLAG_UNALIGNED_2: u8 = 1 << 4;

impl SpotState {
    pub fn primary_id(&self, readno: usize) -> i64 {
        ((self.pid_ext[readno] as i64) << 32) | self.primary_id[readno] as i64
    }

    pub fn set_primary_id(&mut self, readno: usize, value: i64) {
        self.primary_id[readno] = value as u32;
        self.pid_ext[readno] = (value >> 32) as u8;
    }

    pub fn spot_id(&self) -> i64 {
        ((self.spot_id_ext as i64) << 32) | self.spot_id as i64
    }

    pub fn set_spot_id(&mut self, value: i64) {
        self.spot_id = value as u32;
        self.spot_id_ext = (value >> 32) as u8;
    }

    pub fn alignment_count(&self, readno: usize) -> u8 {
        self.alignment_count[readno]
    }

    /// Saturating at 254; never wraps.
    pub fn bump_alignment_count(&mut self, readno: usize) {
        if self.alignment_count[readno] < 254 {
            self.alignment_count[readno] += 1;
        }
    }

    fn flag(&self, mask: u8) -> bool {
        self.flags & mask != 0
    }

    fn set_flag(&mut self, mask: u8, value: bool) {
        if value {
            self.flags |= mask;
        } else {
            self.flags &= !mask;
        }
    }

    pub fn unmated(&self) -> bool {
        self.flag(FLAG_UNMATED)
    }

    pub fn set_unmated(&mut self, v: bool) {
        self.set_flag(FLAG_UNMATED, v)
    }

    pub fn pcr_dup(&self) -> bool {
        self.flag(FLAG_PCR_DUP)
    }

    pub fn set_pcr_dup(&mut self, v: bool) {
        self.set_flag(FLAG_PCR_DUP, v)
    }

    pub fn has_a_read(&self) -> bool {
        self.flag(FLAG_HAS_A_READ)
    }

    pub fn set_has_a_read(&mut self, v: bool) {
        self.set_flag(FLAG_HAS_A_READ, v)
    }

    pub fn unaligned(&self, readno: usize) -> bool {
        self.flag(if readno == 0 { FLAG_UNALIGNED_1 } else { FLAG_UNALIGNED_2 })
    }

    pub fn set_unaligned(&mut self, readno: usize, v: bool) {
        self.set_flag(if readno == 0 { FLAG_UNALIGNED_1 } else { FLAG_UNALIGNED_2 }, v)
    }
}

/// File-backed sparse array of [`SpotState`], chunk-mapped on demand.
pub struct ArenaTable {
    file: File,
    elem_size: usize,
    file_size: u64,
    maps: Vec<Vec<Option<MmapMut>>>,
}

impl ArenaTable {
    pub fn create(tmp_dir: &Path) -> Result<ArenaTable> {
        let path = tmp_dir.join(format!(
            "id2value.{}.{}",
            std::process::id(),
            super::next_spill_id()
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        // keep only the descriptor; the spill file vanishes with the run
        let _ = std::fs::remove_file(&path);
        let elem_size = (std::mem::size_of::<SpotState>() + 3) & !3;
        Ok(ArenaTable {
            file,
            elem_size,
            file_size: 0,
            maps: (0..NUM_PARTITIONS).map(|_| (0..SUBCHUNK_COUNT).map(|_| None).collect()).collect(),
        })
    }

    fn locate(&self, key: u64) -> Result<(usize, usize, u64)> {
        let partition = (key >> 32) as usize;
        if partition >= NUM_PARTITIONS {
            return Err(LoaderError::runtime(format!("Arena key {} out of range", key)));
        }
        let low = key as u32;
        let subchunk = (low >> SUBCHUNK_BITS) as usize;
        let in_chunk = (low as u64) & (SUBCHUNK_SLOTS - 1);
        Ok((partition, subchunk, in_chunk))
    }

    fn chunk_bytes(&self) -> u64 {
        SUBCHUNK_SLOTS * self.elem_size as u64
    }

    /// Mutable access; materializes the slot's subchunk on first touch.
    /// Fresh slots read as zeroes.
    pub fn state_mut(&mut self, key: u64) -> Result<&mut SpotState> {
        let (partition, subchunk, in_chunk) = self.locate(key)?;
        if self.maps[partition][subchunk].is_none() {
            let offset = self.file_size;
            let chunk = self.chunk_bytes();
            self.file.set_len(offset + chunk)?;
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(chunk as usize)
                    .map_mut(&self.file)
            }?;
            self.file_size = offset + chunk;
            self.maps[partition][subchunk] = Some(map);
        }
        let map = self.maps[partition][subchunk].as_mut().unwrap();
        let start = in_chunk as usize * self.elem_size;
        let bytes = &mut map[start..start + std::mem::size_of::<SpotState>()];
        // the mapping is page-aligned and elem_size is a multiple of the
        // struct's alignment, so the cast is sound
        Ok(unsafe { &mut *(bytes.as_mut_ptr() as *mut SpotState) })
    }

    /// Read access to a slot that must already be materialized.
    pub fn state(&self, key: u64) -> Result<&SpotState> {
        let (partition, subchunk, in_chunk) = self.locate(key)?;
        let map = self.maps[partition][subchunk]
            .as_ref()
            .ok_or_else(|| LoaderError::runtime(format!("Arena key {} was never written", key)))?;
        let start = in_chunk as usize * self.elem_size;
        let bytes = &map[start..start + std::mem::size_of::<SpotState>()];
        Ok(unsafe { &*(bytes.as_ptr() as *const SpotState) })
    }

    pub fn resident_bytes(&self) -> u64 {
        self.file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_packing() {
        let mut state = SpotState::default();
        state.set_primary_id(0, 0x12_3456_789A);
        state.set_primary_id(1, 7);
        state.set_spot_id(0xFF_0000_0001);
        assert_eq!(state.primary_id(0), 0x12_3456_789A);
        assert_eq!(state.primary_id(1), 7);
        assert_eq!(state.spot_id(), 0xFF_0000_0001);
    }

    #[test]
    fn test_alignment_count_saturates() {
        let mut state = SpotState::default();
        for _ in 0..300 {
            state.bump_alignment_count(0);
        }
        assert_eq!(state.alignment_count(0), 254);
        assert_eq!(state.alignment_count(1), 0);
    }

    #[test]
    fn test_flags_are_independent() {
        let mut state = SpotState::default();
        state.set_unmated(true);
        state.set_unaligned(1, true);
        assert!(state.unmated());
        assert!(!state.pcr_dup());
        assert!(!state.unaligned(0));
        assert!(state.unaligned(1));
        state.set_unmated(false);
        assert!(!state.unmated());
        assert!(state.unaligned(1));
    }

    #[test]
    fn test_arena_slots_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaTable::create(dir.path()).unwrap();
        let key_a = (3u64 << 32) | 17;
        let key_b = (200u64 << 32) | 1_500_000; // different partition and subchunk
        {
            let state = arena.state_mut(key_a).unwrap();
            assert_eq!(state.spot_id(), 0); // zero-initialized
            state.set_spot_id(42);
            state.set_unmated(true);
        }
        {
            let state = arena.state_mut(key_b).unwrap();
            state.set_spot_id(77);
        }
        assert_eq!(arena.state(key_a).unwrap().spot_id(), 42);
        assert!(arena.state(key_a).unwrap().unmated());
        assert_eq!(arena.state(key_b).unwrap().spot_id(), 77);
        assert!(arena.state((9u64 << 32) | 5).is_err());
    }
}
