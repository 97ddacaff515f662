//! Patchable 12-byte branch slots, the x86-64 encoding of a `gbr` to a
//! constant guest target. Grounded on `dbt/qjit/qcg/jitabi.h`'s
//! `ppoint::BranchSlot` and the shapes described for `stub_link_branch`.
//!
//! A slot starts **unlinked** (a call into the lazy-link stub) and is
//! rewritten in place, exactly once, the first time it is reached:
//! `link()` picks the near or far shape depending on whether the target
//! is reachable with a `rel32`.

use std::ptr::NonNull;

pub const SLOT_SIZE: usize = 12;
/// Trailing bytes after the 12-byte slot body: the constant guest IP the
/// lazy-link stub recovers, with bit 31 stolen as the cross-segment flag
/// (guest text never reaches the top of the 32-bit space in practice).
pub const SLOT_TRAILER_SIZE: usize = 4;
pub const SLOT_TOTAL_SIZE: usize = SLOT_SIZE + SLOT_TRAILER_SIZE;

const CROSS_SEGMENT_BIT: u32 = 1 << 31;

#[derive(Clone, Copy)]
pub struct BranchSlot {
    base: NonNull<u8>,
}

impl BranchSlot {
    /// # Safety
    /// `base` must point at `SLOT_TOTAL_SIZE` writable, executable bytes
    /// carved out of the tcache's code pool.
    pub unsafe fn from_raw(base: NonNull<u8>) -> Self {
        BranchSlot { base }
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Recovers the slot from the return address `call rax` pushed in
    /// the unlinked shape (`write_unlinked`): the `call` is the last two
    /// bytes of the 12-byte body, so the return address always lands
    /// exactly `SLOT_SIZE` bytes past the slot's base.
    ///
    /// # Safety
    /// `ret_addr` must be a return address captured at the entry of
    /// `stub_link_branch`, i.e. it must actually point just past an
    /// unlinked slot's `call rax`.
    pub unsafe fn from_return_address(ret_addr: *const u8) -> Self {
        BranchSlot { base: NonNull::new_unchecked(ret_addr.sub(SLOT_SIZE) as *mut u8) }
    }

    fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), SLOT_TOTAL_SIZE) }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), SLOT_TOTAL_SIZE) }
    }

    pub fn gip(&self) -> u32 {
        let raw = u32::from_le_bytes(self.bytes()[SLOT_SIZE..SLOT_TOTAL_SIZE].try_into().unwrap());
        raw & !CROSS_SEGMENT_BIT
    }

    pub fn cross_segment(&self) -> bool {
        let raw = u32::from_le_bytes(self.bytes()[SLOT_SIZE..SLOT_TOTAL_SIZE].try_into().unwrap());
        raw & CROSS_SEGMENT_BIT != 0
    }

    /// Writes the initial unlinked shape: `mov rax, imm64(stub); call rax`,
    /// followed by the trailing `gip`/flag word.
    pub fn write_unlinked(&self, stub: usize, gip: u32, cross_segment: bool) {
        let b = self.bytes_mut();
        b[0] = 0x48;
        b[1] = 0xb8;
        b[2..10].copy_from_slice(&(stub as u64).to_le_bytes());
        b[10] = 0xff;
        b[11] = 0xd0;
        let trailer = gip | if cross_segment { CROSS_SEGMENT_BIT } else { 0 };
        b[SLOT_SIZE..SLOT_TOTAL_SIZE].copy_from_slice(&trailer.to_le_bytes());
    }

    /// Rewrites the slot in place to jump directly at `target`, picking
    /// the near (`jmp rel32`) shape when reachable, else the far
    /// (`mov rax, imm64; jmp rax`) shape.
    pub fn link(&self, target: *const u8) {
        let slot_addr = self.base.as_ptr() as isize;
        let rel = (target as isize) - (slot_addr + 5);
        let b = self.bytes_mut();
        if let Ok(rel32) = i32::try_from(rel) {
            b[0] = 0xe9;
            b[1..5].copy_from_slice(&rel32.to_le_bytes());
            for slot in &mut b[5..SLOT_SIZE] {
                *slot = 0x90;
            }
        } else {
            b[0] = 0x48;
            b[1] = 0xb8;
            b[2..10].copy_from_slice(&(target as u64).to_le_bytes());
            b[10] = 0xff;
            b[11] = 0xe0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_slot() -> (Vec<u8>, BranchSlot) {
        let mut buf = vec![0u8; SLOT_TOTAL_SIZE];
        let slot = unsafe { BranchSlot::from_raw(NonNull::new(buf.as_mut_ptr()).unwrap()) };
        (buf, slot)
    }

    #[test]
    fn unlinked_roundtrips_gip_and_flag() {
        let (_buf, slot) = alloc_slot();
        slot.write_unlinked(0x1000, 0xdead_beef, true);
        assert_eq!(slot.gip(), 0xdead_beef & 0x7fff_ffff);
        assert!(slot.cross_segment());
    }

    #[test]
    fn near_link_emits_jmp_rel32() {
        let (buf, slot) = alloc_slot();
        let target = unsafe { buf.as_ptr().add(1000) };
        slot.link(target);
        assert_eq!(buf[0], 0xe9);
    }

    #[test]
    fn far_link_emits_mov_jmp() {
        let (buf, slot) = alloc_slot();
        slot.link(usize::MAX as *const u8);
        assert_eq!(buf[0], 0x48);
        assert_eq!(buf[1], 0xb8);
        assert_eq!(buf[10], 0xff);
        assert_eq!(buf[11], 0xe0);
    }
}
