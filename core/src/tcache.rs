//! The translation cache: an ordered index of translated blocks plus two
//! small direct-mapped hash caches used on the hot return-from-block path.
//!
//! Grounded on `dbt/tcache/tcache.{h,cpp}`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::arena::Arena;

pub const JMP_CACHE_BITS: u32 = 12;
pub const JMP_CACHE_SIZE: usize = 1 << JMP_CACHE_BITS;

const TB_POOL_SIZE: usize = 32 * 1024 * 1024;
const CODE_POOL_SIZE: usize = 128 * 1024 * 1024;

#[derive(Default)]
pub struct TBlockFlags {
    pub is_brind_target: Cell<bool>,
    pub is_segment_entry: Cell<bool>,
}

/// One translated guest region: its host code location and entry IP.
/// Allocated out of `TCache::tb_pool` and never individually freed — it
/// dies when the pool is reset.
#[repr(align(8))]
pub struct TBlock {
    pub tcode_ptr: Cell<*mut u8>,
    pub tcode_size: Cell<usize>,
    pub ip: u32,
    pub flags: TBlockFlags,
}

impl TBlock {
    fn new(ip: u32) -> Self {
        TBlock {
            tcode_ptr: Cell::new(std::ptr::null_mut()),
            tcode_size: Cell::new(0),
            ip,
            flags: TBlockFlags::default(),
        }
    }
}

#[inline]
fn jmp_hash(ip: u32) -> usize {
    ((ip >> 2) & (JMP_CACHE_SIZE as u32 - 1)) as usize
}

pub struct TCache {
    tb_pool: Arena,
    code_pool: Arena,
    map: RefCell<BTreeMap<u32, NonNull<TBlock>>>,
    jmp_cache_generic: RefCell<Box<[Option<NonNull<TBlock>>; JMP_CACHE_SIZE]>>,
    jmp_cache_brind: RefCell<Box<[Option<NonNull<TBlock>>; JMP_CACHE_SIZE]>>,
}

// A TCache is owned by the single executing guest thread; `Cell`/`RefCell`
// interior mutability is sound because there is no concurrent access.
unsafe impl Send for TCache {}

impl TCache {
    pub fn new() -> Self {
        TCache {
            tb_pool: Arena::new(TB_POOL_SIZE, libc::PROT_READ | libc::PROT_WRITE),
            code_pool: Arena::new(
                CODE_POOL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            ),
            map: RefCell::new(BTreeMap::new()),
            jmp_cache_generic: RefCell::new(Box::new([None; JMP_CACHE_SIZE])),
            jmp_cache_brind: RefCell::new(Box::new([None; JMP_CACHE_SIZE])),
        }
    }

    /// Hot path: hash straight to the slot, no map probe. Correct whenever
    /// the slot happens to hold the right block; callers fall back to
    /// `lookup` on a miss.
    pub fn lookup_fast(&self, ip: u32) -> Option<NonNull<TBlock>> {
        let slot = self.jmp_cache_generic.borrow()[jmp_hash(ip)];
        slot.filter(|tb| unsafe { tb.as_ref().ip == ip })
    }

    pub fn lookup(&self, ip: u32) -> Option<NonNull<TBlock>> {
        if let Some(tb) = self.lookup_fast(ip) {
            return Some(tb);
        }
        let tb = *self.map.borrow().get(&ip)?;
        self.jmp_cache_generic.borrow_mut()[jmp_hash(ip)] = Some(tb);
        Some(tb)
    }

    /// The first block whose entry IP is strictly greater than `gip`,
    /// used by the translator to bound how far a new block may extend
    /// before it would overlap an already-translated one.
    pub fn lookup_upper_bound(&self, gip: u32) -> Option<u32> {
        self.map
            .borrow()
            .range((std::ops::Bound::Excluded(gip), std::ops::Bound::Unbounded))
            .next()
            .map(|(&ip, _)| ip)
    }

    pub fn insert(&self, tb: NonNull<TBlock>) {
        let ip = unsafe { tb.as_ref().ip };
        self.map.borrow_mut().insert(ip, tb);
        self.jmp_cache_generic.borrow_mut()[jmp_hash(ip)] = Some(tb);
    }

    pub fn cache_brind(&self, tb: NonNull<TBlock>) {
        let ip = unsafe { tb.as_ref().ip };
        self.jmp_cache_brind.borrow_mut()[jmp_hash(ip)] = Some(tb);
        unsafe { tb.as_ref().flags.is_brind_target.set(true) };
    }

    pub fn lookup_brind_fast(&self, ip: u32) -> Option<NonNull<TBlock>> {
        let slot = self.jmp_cache_brind.borrow()[jmp_hash(ip)];
        slot.filter(|tb| unsafe { tb.as_ref().ip == ip })
    }

    /// Marks `tb` as a segment entry point (a guest page's AOT-visible
    /// entry, or the process's initial IP). Advisory only, same mutation
    /// discipline as `is_brind_target`.
    pub fn mark_segment_entry(&self, tb: NonNull<TBlock>) {
        unsafe { tb.as_ref().flags.is_segment_entry.set(true) };
    }

    /// Every currently installed block, ascending by guest entry IP —
    /// the profile store's exit-time flush walks this to fold each
    /// block's tracked flags into its page's record.
    pub fn blocks(&self) -> Vec<NonNull<TBlock>> {
        self.map.borrow().values().copied().collect()
    }

    pub fn allocate_tblock(&self, ip: u32) -> NonNull<TBlock> {
        match self.tb_pool.allocate::<TBlock>() {
            Some(mem) => {
                unsafe { mem.as_ptr().write(TBlock::new(ip)) };
                mem
            }
            None => {
                self.invalidate_all();
                let mem = self
                    .tb_pool
                    .allocate::<TBlock>()
                    .expect("tb_pool exhausted immediately after invalidate");
                unsafe { mem.as_ptr().write(TBlock::new(ip)) };
                mem
            }
        }
    }

    pub fn allocate_code(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.code_pool.allocate_slice(size, align) {
            Some(p) => p,
            None => {
                self.invalidate_all();
                self.code_pool
                    .allocate_slice(size, align)
                    .expect("code_pool exhausted immediately after invalidate")
            }
        }
    }

    /// Drop every translated block and reset both arenas. Any host code
    /// currently executing a branch slot that targets a discarded block
    /// must go through the execution loop again before it can re-link.
    pub fn invalidate_all(&self) {
        self.map.borrow_mut().clear();
        self.jmp_cache_generic
            .borrow_mut()
            .iter_mut()
            .for_each(|s| *s = None);
        self.jmp_cache_brind
            .borrow_mut()
            .iter_mut()
            .for_each(|s| *s = None);
        self.tb_pool.reset();
        self.code_pool.reset();
    }
}

impl Default for TCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(tc: &TCache, ip: u32) -> NonNull<TBlock> {
        let tb = tc.allocate_tblock(ip);
        tc.insert(tb);
        tb
    }

    #[test]
    fn insert_then_lookup() {
        let tc = TCache::new();
        let tb = make_block(&tc, 0x1000);
        let found = tc.lookup(0x1000).unwrap();
        assert_eq!(found.as_ptr(), tb.as_ptr());
    }

    #[test]
    fn lookup_miss_returns_none() {
        let tc = TCache::new();
        assert!(tc.lookup(0x1234).is_none());
    }

    #[test]
    fn upper_bound_finds_next_block() {
        let tc = TCache::new();
        make_block(&tc, 0x1000);
        make_block(&tc, 0x2000);
        assert_eq!(tc.lookup_upper_bound(0x1500), Some(0x2000));
        assert_eq!(tc.lookup_upper_bound(0x2000), None);
        assert_eq!(tc.lookup_upper_bound(0x0), Some(0x1000));
    }

    #[test]
    fn invalidate_clears_everything() {
        let tc = TCache::new();
        make_block(&tc, 0x1000);
        tc.invalidate_all();
        assert!(tc.lookup(0x1000).is_none());
        assert_eq!(tc.tb_pool.used(), 0);
    }

    #[test]
    fn brind_cache_round_trip() {
        let tc = TCache::new();
        let tb = make_block(&tc, 0x4000);
        tc.cache_brind(tb);
        let found = tc.lookup_brind_fast(0x4000).unwrap();
        assert_eq!(found.as_ptr(), tb.as_ptr());
        assert!(unsafe { found.as_ref().flags.is_brind_target.get() });
    }

    #[test]
    fn blocks_are_listed_in_ascending_ip_order() {
        let tc = TCache::new();
        make_block(&tc, 0x2000);
        make_block(&tc, 0x1000);
        make_block(&tc, 0x3000);
        let ips: Vec<u32> = tc.blocks().iter().map(|tb| unsafe { tb.as_ref().ip }).collect();
        assert_eq!(ips, vec![0x1000, 0x2000, 0x3000]);
    }
}
