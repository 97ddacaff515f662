//! The execution loop: looks up or compiles the block at the current
//! guest IP, enters it through the trampoline, and keeps going until a
//! trap is raised.
//!
//! Grounded on `dbt/qjit/qjit.cpp`'s `Qjit::Execute`: the "lookup, miss
//! ⇒ compile, enter, branch_slot ⇒ update ip" loop described in the
//! design's execution-loop pseudocode. Servicing a trap (syscall entry,
//! guest `ebreak`, an illegal-instruction policy decision) is left to
//! the caller — this crate stops at the boundary and hands back a
//! `CpuState` with `trapno` set; the collaborator clears it before
//! calling `execute` again.

use std::ptr::NonNull;

use crate::compile::compile_at;
use crate::qcg::branchslot::BranchSlot;
use crate::qir::StateInfo;
use crate::runtime::{StubTable, TCacheGuard};
use crate::state::{CurrentGuard, CpuState, TrapNo};
use crate::tcache::TCache;
use crate::trampoline;

/// Runs `state` until a trap is raised (`state.trapno != TrapNo::None`)
/// or the guest jumps to a misaligned IP, at which point `execute`
/// returns with `trapno` describing why. `read_u32` fetches a guest
/// instruction word at a guest address — the ELF loader's mapped image,
/// in practice.
pub fn execute(
    state: &mut CpuState,
    tcache: &TCache,
    state_info: &StateInfo,
    stubs: &StubTable,
    zero_mmu_base: bool,
    read_u32: impl Fn(u32) -> u32,
) {
    let _state_guard = CurrentGuard::install(state);
    let _tcache_guard = TCacheGuard::install(tcache);

    loop {
        if state.ip % 4 != 0 {
            state.raise(TrapNo::UnalignedIp);
            return;
        }

        let tb = tcache
            .lookup(state.ip)
            .unwrap_or_else(|| compile_at(tcache, state_info, stubs, state.ip, zero_mmu_base, &read_u32));
        let tcode = unsafe { tb.as_ref().tcode_ptr.get() };

        let retval = trampoline::enter(state, tcode);
        if state.is_trap_pending() {
            return;
        }
        if retval != 0 {
            let slot = unsafe { BranchSlot::from_raw(NonNull::new_unchecked(retval as *mut u8)) };
            state.ip = slot.gip();
        }
    }
}
