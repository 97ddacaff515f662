//! Persistent per-page profile: which guest instruction words have
//! executed, which were an indirect-branch target, which were a
//! segment entry. Survives across runs of the same guest binary so a
//! later AOT compile can see what the interpreter/JIT actually touched.
//!
//! Grounded on `dbt/tcache/objprof.cpp`: a `memmap2`-backed file, keyed
//! to the guest ELF by an MD5 checksum (`md-5`) so a stale profile for a
//! rebuilt binary is rejected rather than silently reused.
//!
//! Layout: a 16-byte MD5 checksum followed by a 4-byte page count, then
//! one fixed-size record per touched page — a 4-byte page number and
//! three 1024-bit (128-byte) bitmaps, one bit per guest instruction
//! word, in `executed`/`brind_target`/`segment_entry` order.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use md5::{Digest, Md5};
use memmap2::MmapMut;

use rvdbt_common::page::{page_number, page_offset, PAGE_SIZE};

use crate::error::DbtError;

pub const PROFILE_FILE_SIZE: u64 = 64 * 1024 * 1024;

const CHECKSUM_SIZE: usize = 16;
const HEADER_SIZE: usize = CHECKSUM_SIZE + 4;
const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;
const BITSET_BYTES: usize = WORDS_PER_PAGE / 8;
const RECORD_SIZE: usize = 4 + BITSET_BYTES * 3;
const MAX_RECORDS: usize = (PROFILE_FILE_SIZE as usize - HEADER_SIZE) / RECORD_SIZE;

const EXECUTED: usize = 0;
const BRIND_TARGET: usize = 1;
const SEGMENT_ENTRY: usize = 2;

pub struct ProfileStore {
    mmap: MmapMut,
    index: HashMap<u32, usize>,
    n_pages: u32,
}

fn io_err(path: &Path, e: std::io::Error) -> DbtError {
    DbtError::ProfileMismatch(format!("{}: {e}", path.display()))
}

impl ProfileStore {
    /// Opens (creating if absent) the profile file at `path` for the
    /// guest image `elf_bytes`. A fresh file is stamped with the
    /// image's checksum; an existing one is rejected outright —
    /// `DbtError::ProfileMismatch`, never a silent rebuild — if its
    /// checksum doesn't match.
    pub fn open(path: &Path, elf_bytes: &[u8]) -> Result<Self, DbtError> {
        let checksum = md5_of(elf_bytes);
        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        file.set_len(PROFILE_FILE_SIZE).map_err(|e| io_err(path, e))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| io_err(path, e))? };

        if is_new {
            mmap[..CHECKSUM_SIZE].copy_from_slice(&checksum);
            mmap[CHECKSUM_SIZE..HEADER_SIZE].copy_from_slice(&0u32.to_le_bytes());
        } else if mmap[..CHECKSUM_SIZE] != checksum {
            return Err(DbtError::ProfileMismatch(path.display().to_string()));
        }

        let n_pages = u32::from_le_bytes(mmap[CHECKSUM_SIZE..HEADER_SIZE].try_into().unwrap());
        let mut index = HashMap::new();
        for slot in 0..n_pages as usize {
            let off = HEADER_SIZE + slot * RECORD_SIZE;
            let page_no = u32::from_le_bytes(mmap[off..off + 4].try_into().unwrap());
            index.insert(page_no, slot);
        }

        Ok(ProfileStore { mmap, index, n_pages })
    }

    fn record_offset(&mut self, page_no: u32) -> usize {
        if let Some(&slot) = self.index.get(&page_no) {
            return HEADER_SIZE + slot * RECORD_SIZE;
        }
        let slot = self.n_pages as usize;
        assert!(slot < MAX_RECORDS, "profile store: page table exhausted");
        let off = HEADER_SIZE + slot * RECORD_SIZE;
        self.mmap[off..off + 4].copy_from_slice(&page_no.to_le_bytes());
        self.index.insert(page_no, slot);
        self.n_pages += 1;
        self.mmap[CHECKSUM_SIZE..HEADER_SIZE].copy_from_slice(&self.n_pages.to_le_bytes());
        off
    }

    fn set_bit(&mut self, gaddr: u32, bitmap: usize) {
        let page_no = page_number(gaddr);
        let word = (page_offset(gaddr) / 4) as usize;
        let rec = self.record_offset(page_no);
        let bitmap_off = rec + 4 + bitmap * BITSET_BYTES;
        self.mmap[bitmap_off + word / 8] |= 1u8 << (word % 8);
    }

    pub fn mark_executed(&mut self, gaddr: u32) {
        self.set_bit(gaddr, EXECUTED);
    }

    pub fn mark_brind_target(&mut self, gaddr: u32) {
        self.set_bit(gaddr, BRIND_TARGET);
    }

    pub fn mark_segment_entry(&mut self, gaddr: u32) {
        self.set_bit(gaddr, SEGMENT_ENTRY);
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.mmap.flush()
    }

    fn addrs_with_bit_set(&self, bitmap: usize) -> Vec<u32> {
        let mut out = Vec::new();
        for (&page_no, &slot) in &self.index {
            let rec = HEADER_SIZE + slot * RECORD_SIZE;
            let bitmap_off = rec + 4 + bitmap * BITSET_BYTES;
            for byte in 0..BITSET_BYTES {
                let b = self.mmap[bitmap_off + byte];
                if b == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if b & (1 << bit) != 0 {
                        let word = byte * 8 + bit;
                        out.push(page_no * PAGE_SIZE as u32 + (word * 4) as u32);
                    }
                }
            }
        }
        out
    }

    /// Guest addresses a prior run recorded as the target of an indirect
    /// branch — the AOT driver's seed for `brind_targets`, so a compiled
    /// image can publish symbols for sites it has actually seen jumped to.
    pub fn brind_targets(&self) -> Vec<u32> {
        self.addrs_with_bit_set(BRIND_TARGET)
    }

    /// Guest addresses a prior run entered as a segment/page entry —
    /// the AOT driver's seed for `entries`.
    pub fn segment_entries(&self) -> Vec<u32> {
        self.addrs_with_bit_set(SEGMENT_ENTRY)
    }
}

fn md5_of(bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rvdbt-profile-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn fresh_file_stamps_checksum_and_accepts_marks() {
        let dir = scratch_dir("fresh");
        let path = dir.join("profile.bin");
        let elf = b"not a real elf, just checksum fodder";

        {
            let mut store = ProfileStore::open(&path, elf).unwrap();
            store.mark_executed(0x1000);
            store.mark_brind_target(0x1004);
        }
        let mut reopened = ProfileStore::open(&path, elf).unwrap();
        reopened.mark_segment_entry(0x1000);
        assert_eq!(reopened.n_pages, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn checksum_mismatch_is_rejected_not_rebuilt() {
        let dir = scratch_dir("mismatch");
        let path = dir.join("profile.bin");
        ProfileStore::open(&path, b"image one").unwrap();
        let err = ProfileStore::open(&path, b"a completely different image").unwrap_err();
        assert!(matches!(err, DbtError::ProfileMismatch(_)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
