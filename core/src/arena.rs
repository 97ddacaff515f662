//! A single `mmap`-backed bump allocator.
//!
//! Two arenas live process-wide inside `TCache`: `tb_pool` (RW, holds
//! `TBlock`s) and `code_pool` (RWX, holds emitted machine code). Reset is
//! O(1) and never touches memory; there is no per-object free. Grounded
//! on `dbt/arena.{h,cpp}`'s `MemArena`.

use std::cell::Cell;
use std::ptr::NonNull;

use rvdbt_common::page::round_up;

pub struct Arena {
    base: *mut u8,
    size: usize,
    used: Cell<usize>,
}

// The arena itself holds no aliasing Rust references into its memory;
// callers are responsible for not creating overlapping &mut borrows of
// what they allocate. It lives for the process lifetime of a single
// guest task, which is always single-threaded.
unsafe impl Send for Arena {}

impl Arena {
    /// `prot` is a `libc::PROT_*` bitmask: `PROT_READ|PROT_WRITE` for the
    /// `TBlock` pool, `PROT_READ|PROT_WRITE|PROT_EXEC` for the code pool.
    pub fn new(size: usize, prot: i32) -> Self {
        let size = round_up(size, 4096);
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!("Arena::new: mmap({size} bytes) failed");
        }
        Arena {
            base: base as *mut u8,
            size,
            used: Cell::new(0),
        }
    }

    /// Bump-allocate `size` bytes aligned to `align`. Returns `None` on
    /// exhaustion; the caller (the tcache) decides whether to flush and
    /// retry.
    pub fn allocate_raw(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let used = self.used.get();
        let start = round_up(used, align);
        let end = start.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.used.set(end);
        // SAFETY: `start` is within `[0, self.size)` by the check above,
        // and `self.base` is a live mapping of `self.size` bytes.
        NonNull::new(unsafe { self.base.add(start) })
    }

    pub fn allocate<T>(&self) -> Option<NonNull<T>> {
        self.allocate_raw(std::mem::size_of::<T>(), std::mem::align_of::<T>())
            .map(|p| p.cast())
    }

    pub fn allocate_slice(&self, len: usize, align: usize) -> Option<NonNull<u8>> {
        self.allocate_raw(len, align)
    }

    /// O(1): return the bump pointer to zero without touching memory.
    /// Any live pointers into the arena are invalidated by convention —
    /// callers must re-lookup (see `TCache::invalidate_all`).
    pub fn reset(&self) {
        self.used.set(0);
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonicity_while_no_reset() {
        let a = Arena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        let p1 = a.allocate_raw(16, 8).unwrap();
        let p2 = a.allocate_raw(16, 8).unwrap();
        let p3 = a.allocate_raw(16, 8).unwrap();
        assert!(p2.as_ptr() as usize >= p1.as_ptr() as usize);
        assert!(p3.as_ptr() as usize >= p2.as_ptr() as usize);
    }

    #[test]
    fn reset_returns_bump_pointer_to_zero() {
        let a = Arena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        a.allocate_raw(100, 8).unwrap();
        assert_ne!(a.used(), 0);
        a.reset();
        assert_eq!(a.used(), 0);
        let p = a.allocate_raw(16, 8).unwrap();
        assert_eq!(p.as_ptr(), a.base());
    }

    #[test]
    fn exhaustion_returns_none() {
        let a = Arena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        assert!(a.allocate_raw(4096, 8).is_some());
        assert!(a.allocate_raw(1, 1).is_none());
    }

    #[test]
    fn alignment_is_respected() {
        let a = Arena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        let _ = a.allocate_raw(1, 1).unwrap();
        let p = a.allocate_raw(8, 16).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
    }
}
