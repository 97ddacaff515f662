//! Guest address space manager.
//!
//! Reserves a contiguous 4 GiB host window at startup and hands out
//! `g2h`/`h2g`/`in_guest` conversions plus a guest-side `mmap`. The
//! `used_pages` bitset is the sole authority for free space — unlike a
//! real MMU, nothing here enforces permissions beyond what the host
//! `mmap`/`mprotect` already provides on the linear mapping; there is no
//! page-level permission emulation.
//!
//! Grounded on `dbt/mmu.{h,cpp}`'s `mmu` struct.

use rvdbt_common::bitset::BitSet;
use rvdbt_common::page::{round_up, PAGE_BITS, PAGE_SIZE};
use rvdbt_common::GAddr;

pub const ASPACE_SIZE: u64 = 1u64 << 32;
pub const MIN_MMAP_ADDR: u32 = PAGE_SIZE as u32;

/// When set, `base` is null and guest pointers equal host pointers
/// one-to-one (only viable when the process itself is mapped outside
/// the low 4 GiB, or for testing without the real reservation).
pub const ZERO_MMU_BASE: bool = false;

pub struct AddressSpace {
    base: *mut u8,
    used_pages: BitSet,
    mmap_hint_page: u32,
}

// Guest memory belongs to one single-threaded guest task; the address
// space is owned by the executing thread.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    pub fn new() -> Self {
        let base = if ZERO_MMU_BASE {
            std::ptr::null_mut()
        } else {
            // Reserve the full window, then drop everything but the
            // first page: the remaining hole is where `mmap` below will
            // place guest-requested mappings at `base + vaddr`.
            let reservation = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    ASPACE_SIZE as usize,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if reservation == libc::MAP_FAILED {
                panic!("AddressSpace::new: failed to reserve 4GiB guest window");
            }
            let rc = unsafe {
                libc::munmap(
                    (reservation as usize + MIN_MMAP_ADDR as usize) as *mut libc::c_void,
                    ASPACE_SIZE as usize - MIN_MMAP_ADDR as usize,
                )
            };
            if rc != 0 {
                panic!("AddressSpace::new: failed to punch hole in guest window");
            }
            reservation as *mut u8
        };

        let mut used_pages = BitSet::new((ASPACE_SIZE >> PAGE_BITS) as usize);
        used_pages.set_range(0, (MIN_MMAP_ADDR >> PAGE_BITS) as usize);

        log::debug!("aspace: base={base:p}");
        AddressSpace {
            base,
            used_pages,
            mmap_hint_page: MIN_MMAP_ADDR >> PAGE_BITS,
        }
    }

    #[inline]
    pub fn g2h(&self, gaddr: GAddr) -> *mut u8 {
        unsafe { self.base.add(gaddr.get() as usize) }
    }

    #[inline]
    pub fn h2g(&self, hptr: *const u8) -> GAddr {
        GAddr::new((hptr as usize - self.base as usize) as u32)
    }

    #[inline]
    pub fn in_guest(&self, hptr: *const u8) -> bool {
        (hptr as usize).wrapping_sub(self.base as usize) < ASPACE_SIZE as usize
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    fn mark_used(&mut self, page: u32, count: u32) {
        self.used_pages.set_range(page as usize, count as usize);
    }

    fn mark_free(&mut self, page: u32, count: u32) {
        self.used_pages.reset_range(page as usize, count as usize);
    }

    /// Scan forward from `start` for a run of `count` consecutive free
    /// pages; returns the first page of the run, or `None` if the space
    /// is exhausted without wrapping (the caller wraps and retries once,
    /// matching `mmu::mmap`'s `paddr_wrapped` handling).
    fn lookup_free_range(&self, start: u32, count: u32) -> Option<u32> {
        let total_pages = (ASPACE_SIZE >> PAGE_BITS) as u32;
        let mut run = count;
        let mut p = start;
        while p < total_pages {
            if self.used_pages.test(p as usize) {
                run = count;
            } else {
                run -= 1;
                if run == 0 {
                    return Some(p + 1 - count);
                }
            }
            p += 1;
        }
        None
    }

    /// Place a fixed mapping at `g2h(gaddr)`, or (when `gaddr` is `None`)
    /// search `used_pages` for a free run. Mirrors `mmu::mmap`.
    pub fn mmap(
        &mut self,
        gaddr: Option<GAddr>,
        len: u32,
        prot: i32,
        fd: i32,
        offset: i64,
    ) -> Option<GAddr> {
        let len = round_up(len as usize, PAGE_SIZE) as u32;
        let page_count = len >> PAGE_BITS;

        if let Some(gaddr) = gaddr {
            let hptr = self.g2h(gaddr);
            let res = unsafe {
                libc::mmap(
                    hptr as *mut libc::c_void,
                    len as usize,
                    prot,
                    libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
                    fd,
                    offset,
                )
            };
            if res == libc::MAP_FAILED {
                return None;
            }
            self.mark_used(gaddr.page_number(), page_count);
            return Some(gaddr);
        }

        let mut probe = self.mmap_hint_page;
        let mut wrapped = false;
        loop {
            let found = loop {
                match self.lookup_free_range(probe, page_count) {
                    Some(p) => break p,
                    None => {
                        if wrapped {
                            return None;
                        }
                        wrapped = true;
                        probe = MIN_MMAP_ADDR >> PAGE_BITS;
                    }
                }
            };
            let candidate = GAddr::new(found << PAGE_BITS);
            let hptr = self.g2h(candidate);
            let res = unsafe {
                libc::mmap(
                    hptr as *mut libc::c_void,
                    len as usize,
                    prot,
                    libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
                    fd,
                    offset,
                )
            };
            if res == libc::MAP_FAILED {
                panic!("AddressSpace::mmap: host mmap failed");
            }
            self.mark_used(found, page_count);
            self.mmap_hint_page = found + page_count;
            return Some(candidate);
        }
    }

    pub fn munmap(&mut self, gaddr: GAddr, len: u32) {
        let len = round_up(len as usize, PAGE_SIZE) as u32;
        let rc = unsafe { libc::munmap(self.g2h(gaddr) as *mut libc::c_void, len as usize) };
        if rc == 0 {
            self.mark_free(gaddr.page_number(), len >> PAGE_BITS);
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !ZERO_MMU_BASE {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, MIN_MMAP_ADDR as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g2h_h2g_roundtrip() {
        let a = AddressSpace::new();
        let g = GAddr::new(0x1000);
        let h = a.g2h(g);
        assert_eq!(a.h2g(h), g);
        assert!(a.in_guest(h));
    }

    #[test]
    fn low_page_is_reserved() {
        let a = AddressSpace::new();
        assert!(a.used_pages.test(0));
    }

    #[test]
    fn mmap_fixed_marks_pages_used() {
        let mut a = AddressSpace::new();
        let g = GAddr::new(0x0040_0000);
        let res = a.mmap(Some(g), 4096, libc::PROT_READ | libc::PROT_WRITE, -1, 0);
        assert_eq!(res, Some(g));
        assert!(a.used_pages.test(g.page_number() as usize));
    }
}
