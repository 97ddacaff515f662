//! Drives one guest basic block through the QIR compiler pipeline and
//! installs the result in the tcache.
//!
//! Grounded on `dbt/qjit/qjit.cpp`'s `Compile`: translate, legalise,
//! allocate registers, emit, then fix up every patch site the emitter
//! couldn't resolve on its own because it didn't yet know where its
//! code would end up living.

use std::ptr::NonNull;

use crate::qcg::branchslot::BranchSlot;
use crate::qcg::emit::{PendingBranchSlot, PendingStubCall};
use crate::qcg::{qsel, regalloc, Emitter};
use crate::qir::{Region, StateInfo};
use crate::runtime::StubTable;
use crate::tcache::{TBlock, TCache};
use crate::translate::Translator;

/// Rewrites every unresolved branch slot and stub-call site the emitter
/// left behind in a freshly copied code blob, now that the blob has a
/// final address. Shared by the JIT (`compile_at`, patching straight
/// into the tcache's code pool) and the AOT loader (patching a `.aot.so`
/// section right after `dlopen`, against that process's own
/// `StubTable`/lazy-link-stub addresses — an AOT object is not
/// position-independent with respect to those, only with respect to
/// guest code addresses).
pub fn patch_code(
    code_base: *mut u8,
    branch_slots: &[PendingBranchSlot],
    stub_calls: &[PendingStubCall],
    stubs: &StubTable,
) {
    for slot in branch_slots {
        let base = unsafe { NonNull::new_unchecked(code_base.add(slot.code_offset)) };
        let branch_slot = unsafe { BranchSlot::from_raw(base) };
        branch_slot.write_unlinked(stubs.link_branch_addr(), slot.gip, false);
    }

    for call in stub_calls {
        let addr = if call.stub_id == u32::MAX {
            stubs.brind_resolve_addr()
        } else {
            stubs.resolve_hcall(call.stub_id)
        };
        // `emit_call_placeholder`: REX+0xB8 (2 bytes), then the imm64.
        let imm_at = call.code_offset + 2;
        unsafe {
            let dst = code_base.add(imm_at) as *mut u64;
            dst.write_unaligned(addr as u64);
        }
    }
}

/// Compiles the block starting at `ip`, bounded so it never overlaps an
/// already-translated block (`tcache.lookup_upper_bound`), and installs
/// it. `read_u32` fetches a guest instruction word; `zero_mmu_base`
/// selects the backend's addressing mode for guest loads/stores.
pub fn compile_at(
    tcache: &TCache,
    state_info: &StateInfo,
    stubs: &StubTable,
    ip: u32,
    zero_mmu_base: bool,
    read_u32: impl Fn(u32) -> u32,
) -> NonNull<TBlock> {
    let boundary_ip = tcache.lookup_upper_bound(ip).unwrap_or(u32::MAX);

    let mut region = Region::new(state_info);
    let entry = region.create_block();
    Translator::translate(&mut region, entry, ip, boundary_ip, read_u32);

    qsel::legalize(&mut region);
    regalloc::allocate(&mut region, zero_mmu_base);
    let emitted = Emitter::new(&region, zero_mmu_base).emit();

    let tb = tcache.allocate_tblock(ip);
    let code_mem = tcache.allocate_code(emitted.code.len(), 16);
    unsafe {
        std::ptr::copy_nonoverlapping(emitted.code.as_ptr(), code_mem.as_ptr(), emitted.code.len());
    }

    patch_code(code_mem.as_ptr(), &emitted.branch_slots, &emitted.stub_calls, stubs);

    unsafe {
        tb.as_ref().tcode_ptr.set(code_mem.as_ptr());
        tb.as_ref().tcode_size.set(emitted.code.len());
    }
    tcache.insert(tb);
    tb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::guest_state_info;

    #[test]
    fn compiling_a_block_installs_it_and_emits_nonempty_code() {
        let tcache = TCache::new();
        let stubs = StubTable::new();
        let info = guest_state_info();
        // addi x1, x0, 1
        let word = (1u32 << 20) | (0 << 15) | (0b000 << 12) | (1 << 7) | 0b0010011;
        let tb = compile_at(&tcache, &info, &stubs, 0, false, |_| word);
        unsafe {
            assert!(!tb.as_ref().tcode_ptr.get().is_null());
            assert!(tb.as_ref().tcode_size.get() > 0);
        }
        assert!(tcache.lookup(0).is_some());
    }
}
