//! Hand-written x86-64 trampoline in and out of translated code.
//!
//! Grounded on `dbt/qjit/qcg/qjit.cpp`'s `trampoline`/`trampoline_out`
//! pair: save the callee-saved registers the ABI owns, park the host
//! stack pointer so a later escape can unwind back to exactly this
//! point, load the fixed-register ABI (`STATE`, `MEMBASE`), reserve the
//! region's spill frame, then jump into tcode. `escape` is the exact
//! inverse and is the single non-local exit every translated-code path
//! uses: branch-slot link misses, indirect-branch cache misses, and
//! hcall-raised traps all return through it instead of a normal `ret`.
//!
//! Implemented with `global_asm!` rather than a `.S` file: this crate's
//! dependency corpus has no assembler invoked at build time, and
//! `global_asm!` is the stable, no-extra-toolchain equivalent.

use std::arch::global_asm;
use std::mem::offset_of;

use crate::qcg::branchslot::SLOT_SIZE;
use crate::qcg::jitabi::QCG_SPILL_FRAME_SIZE;
use crate::state::CpuState;

const SP_UNWINDPTR_OFFSET: usize = offset_of!(CpuState, sp_unwindptr);
const MEMBASE_OFFSET: usize = offset_of!(CpuState, membase);

extern "C" {
    fn rvdbt_trampoline_to_jit(state: *mut CpuState, tcode: *const u8) -> u64;
    fn rvdbt_escape_stub(state: *mut CpuState, retval: u64) -> !;
    fn rvdbt_stub_link_branch();
}

global_asm!(
    ".globl rvdbt_trampoline_to_jit",
    "rvdbt_trampoline_to_jit:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi + {sp_unwindptr}], rsp",
    "mov r13, rdi",
    "mov rbp, [rdi + {membase}]",
    "sub rsp, {spill_frame}",
    "jmp rsi",
    sp_unwindptr = const SP_UNWINDPTR_OFFSET,
    membase = const MEMBASE_OFFSET,
    spill_frame = const QCG_SPILL_FRAME_SIZE,
);

global_asm!(
    ".globl rvdbt_escape_stub",
    "rvdbt_escape_stub:",
    "mov rax, rsi",
    "mov rsp, [rdi + {sp_unwindptr}]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    sp_unwindptr = const SP_UNWINDPTR_OFFSET,
);

// Entered by a plain `call rax` from an unlinked branch slot (no
// argument registers set up — see `branchslot::BranchSlot::write_unlinked`).
// Recovers the slot from its own return address, asks
// `rvdbt_resolve_link` (runtime.rs) to link it, and either tail-jumps
// into the now-linked target or escapes back to the execution loop on
// a miss. `r12` carries the slot base across the call since it is
// callee-saved.
global_asm!(
    ".globl rvdbt_stub_link_branch",
    "rvdbt_stub_link_branch:",
    "mov rdi, [rsp]",
    "sub rdi, {slot_size}",
    "mov r12, rdi",
    "call rvdbt_resolve_link",
    "test rax, rax",
    "jz 2f",
    "add rsp, 8",
    "jmp rax",
    "2:",
    "call rvdbt_current_state",
    "mov rdi, rax",
    "mov rsi, r12",
    "jmp rvdbt_escape_stub",
    slot_size = const SLOT_SIZE,
);

/// Enters translated code at `tcode`. Returns 0 if control came back via
/// `escape` with no branch slot to link (a trap, or an indirect-branch
/// miss — both already left `state.ip` at the right value); otherwise
/// the nonzero address of the unlinked `BranchSlot` whose `gip` is the
/// guest IP to resume at.
pub fn enter(state: &mut CpuState, tcode: *const u8) -> u64 {
    unsafe { rvdbt_trampoline_to_jit(state as *mut CpuState, tcode) }
}

/// Unwinds out of translated code back to whoever called `enter`,
/// restoring the trampoline's saved frame and callee-saved registers.
/// Never returns to its caller.
///
/// # Safety
/// `state.sp_unwindptr` must have been set by the `enter` call currently
/// on the stack — i.e. this must run on the same host thread, inside
/// the dynamic extent of that call.
pub unsafe fn escape(state: *mut CpuState, retval: u64) -> ! {
    rvdbt_escape_stub(state, retval)
}

pub fn stub_link_branch_addr() -> usize {
    rvdbt_stub_link_branch as usize
}
