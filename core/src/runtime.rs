//! Runtime stubs: the host-native functions `hcall`/`gbrind` sites call
//! into, and the process-wide table that resolves a `StubId` to one.
//!
//! Grounded on `dbt/qjit/runtime_stub.cpp`'s trap and atomic helpers,
//! adapted to the narrower `hcall(state, arg, stub_id)` ABI this
//! backend's emitter uses (`core::qcg::emit::emit_hcall`). Traps never
//! return to their call site: they raise on `CpuState` and escape
//! straight back to the execution loop, matching the "explicit raise
//! stub" the original routes through `siglongjmp` — here the same
//! non-local transfer is `trampoline::escape`, reused rather than
//! introducing a second unwind mechanism for one more case.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::qcg::branchslot::BranchSlot;
use crate::state::{self, CpuState, TrapNo};
use crate::tcache::TCache;
use crate::translate::StubId;
use crate::trampoline;

thread_local! {
    static TCACHE: RefCell<Option<NonNull<TCache>>> = const { RefCell::new(None) };
}

/// Installs `tcache` as the process's active translation cache for the
/// duration of the guard, the way `state::CurrentGuard` installs the
/// active `CpuState`. The brind-resolve and branch-link stubs read it
/// through this thread-local since they are entered as plain function
/// pointers with no spare argument register to carry it explicitly.
pub struct TCacheGuard {
    previous: Option<NonNull<TCache>>,
}

impl TCacheGuard {
    pub fn install(tcache: &TCache) -> Self {
        let previous = TCACHE.with(|c| c.replace(Some(NonNull::from(tcache))));
        TCacheGuard { previous }
    }
}

impl Drop for TCacheGuard {
    fn drop(&mut self) {
        TCACHE.with(|c| *c.borrow_mut() = self.previous);
    }
}

fn current_tcache() -> NonNull<TCache> {
    TCACHE.with(|c| c.borrow().expect("runtime stub ran outside a TCacheGuard"))
}

fn current_state() -> *mut CpuState {
    state::current().expect("runtime stub ran outside a CurrentGuard").as_ptr()
}

/// Extracts the store-value register packed into a hcall site's
/// `stub_id` by `translate::encode_stub`; by the time an hcall runs,
/// `regalloc::allocate`'s `force_globals_to_memory` has synced every
/// guest register to `CpuState::gpr`, so the index alone is enough.
fn packed_rs2(raw_stub_id: u32) -> usize {
    ((raw_stub_id >> 8) & 0xff) as usize
}

unsafe fn raise_and_escape(state: *mut CpuState, trap: TrapNo, ip: u32) -> u64 {
    (*state).ip = ip;
    (*state).raise(trap);
    trampoline::escape(state, 0)
}

unsafe extern "C" fn trap_illegal_insn(state: *mut CpuState, ip: u32, _stub_id: u32) -> u64 {
    raise_and_escape(state, TrapNo::IllegalInsn, ip)
}

unsafe extern "C" fn trap_ebreak(state: *mut CpuState, ip: u32, _stub_id: u32) -> u64 {
    raise_and_escape(state, TrapNo::Ebreak, ip)
}

unsafe extern "C" fn trap_ecall(state: *mut CpuState, ip: u32, _stub_id: u32) -> u64 {
    raise_and_escape(state, TrapNo::Ecall, ip)
}

unsafe fn atomic_u32(state: *mut CpuState, addr: u32) -> &'static AtomicU32 {
    &*((*state).g2h(addr) as *const AtomicU32)
}

unsafe fn atomic_i32(state: *mut CpuState, addr: u32) -> &'static AtomicI32 {
    &*((*state).g2h(addr) as *const AtomicI32)
}

macro_rules! amo_unsigned_stub {
    ($name:ident, $op:ident) => {
        unsafe extern "C" fn $name(state: *mut CpuState, addr: u32, raw_stub_id: u32) -> u64 {
            let rs2 = (*state).gpr[packed_rs2(raw_stub_id)];
            atomic_u32(state, addr).$op(rs2, Ordering::SeqCst);
            0
        }
    };
}

macro_rules! amo_signed_stub {
    ($name:ident, $op:ident) => {
        unsafe extern "C" fn $name(state: *mut CpuState, addr: u32, raw_stub_id: u32) -> u64 {
            let rs2 = (*state).gpr[packed_rs2(raw_stub_id)] as i32;
            atomic_i32(state, addr).$op(rs2, Ordering::SeqCst);
            0
        }
    };
}

amo_unsigned_stub!(amo_swap, swap);
amo_unsigned_stub!(amo_add, fetch_add);
amo_unsigned_stub!(amo_xor, fetch_xor);
amo_unsigned_stub!(amo_and, fetch_and);
amo_unsigned_stub!(amo_or, fetch_or);
amo_signed_stub!(amo_min, fetch_min);
amo_signed_stub!(amo_max, fetch_max);
amo_unsigned_stub!(amo_minu, fetch_min);
amo_unsigned_stub!(amo_maxu, fetch_max);

/// No-op: a single-threaded guest can never have its reservation broken
/// by another hart, so `sc.w` (see `sc_w` below) always succeeds without
/// needing to consult one. Kept as a real hcall site, not folded away in
/// the translator, so a reservation tracker can be added here later
/// without touching `translate.rs`.
unsafe extern "C" fn lr_w(_state: *mut CpuState, _addr: u32, _stub_id: u32) -> u64 {
    0
}

unsafe extern "C" fn sc_w(state: *mut CpuState, addr: u32, raw_stub_id: u32) -> u64 {
    let rs2 = (*state).gpr[packed_rs2(raw_stub_id)];
    atomic_u32(state, addr).store(rs2, Ordering::SeqCst);
    0
}

/// Entered by a plain `call rax` from `qcg::emit::emit_gbrind`'s inline
/// probe: `rdi` carries the resolved target guest IP, nothing else.
/// Returns the target's `tcode` pointer on a cache hit, letting the
/// jitted `jmp rax` continue straight into it; on a miss it sets
/// `state.ip` itself (there is no branch slot to report a target
/// through, unlike `stub_link_branch`) and escapes.
unsafe extern "C" fn stub_resolve_brind(target_ip: u32) -> u64 {
    let tcache = current_tcache();
    if let Some(tb) = tcache.as_ref().lookup(target_ip) {
        tcache.as_ref().cache_brind(tb);
        tb.as_ref().tcode_ptr.get() as u64
    } else {
        let state = current_state();
        (*state).ip = target_ip;
        trampoline::escape(state, 0)
    }
}

/// Called from the `rvdbt_stub_link_branch` asm wrapper with the slot's
/// base address. Returns the target's `tcode` pointer (nonzero) on a
/// hit, having already rewritten the slot to jump straight there; 0 on
/// a miss, leaving the slot unlinked for the caller to escape with.
#[no_mangle]
unsafe extern "C" fn rvdbt_resolve_link(slot_base: *mut u8) -> u64 {
    let slot = BranchSlot::from_raw(NonNull::new_unchecked(slot_base));
    let tcache = current_tcache();
    match tcache.as_ref().lookup(slot.gip()) {
        Some(tb) => {
            let tcode = tb.as_ref().tcode_ptr.get();
            slot.link(tcode);
            tcode as u64
        }
        None => 0,
    }
}

#[no_mangle]
unsafe extern "C" fn rvdbt_current_state() -> *mut CpuState {
    current_state()
}

/// Host function-pointer addresses a `StubId` (masked to its low byte)
/// resolves to. Built once per process; `compile.rs` consults it to
/// patch every `PendingStubCall` site as a region is installed in the
/// tcache.
pub struct StubTable {
    funcs: [usize; 14],
}

impl StubTable {
    pub fn new() -> Self {
        let mut funcs = [0usize; 14];
        funcs[StubId::TrapIllegalInsn as usize] = trap_illegal_insn as usize;
        funcs[StubId::TrapEbreak as usize] = trap_ebreak as usize;
        funcs[StubId::TrapEcall as usize] = trap_ecall as usize;
        funcs[StubId::AmoSwap as usize] = amo_swap as usize;
        funcs[StubId::AmoAdd as usize] = amo_add as usize;
        funcs[StubId::AmoXor as usize] = amo_xor as usize;
        funcs[StubId::AmoAnd as usize] = amo_and as usize;
        funcs[StubId::AmoOr as usize] = amo_or as usize;
        funcs[StubId::AmoMin as usize] = amo_min as usize;
        funcs[StubId::AmoMax as usize] = amo_max as usize;
        funcs[StubId::AmoMinu as usize] = amo_minu as usize;
        funcs[StubId::AmoMaxu as usize] = amo_maxu as usize;
        funcs[StubId::LrW as usize] = lr_w as usize;
        funcs[StubId::ScW as usize] = sc_w as usize;
        StubTable { funcs }
    }

    /// Resolves a `hcall`'s `stub_id` (masked to the low byte that picks
    /// the function; the high bytes are the packed `rs2` the function
    /// itself decodes back out at call time).
    pub fn resolve_hcall(&self, stub_id: u32) -> usize {
        self.funcs[(stub_id & 0xff) as usize]
    }

    /// The brind-resolve stub's address, patched into every `gbrind`
    /// site's `PendingStubCall` (the `stub_id == u32::MAX` sentinel).
    pub fn brind_resolve_addr(&self) -> usize {
        stub_resolve_brind as usize
    }

    /// The lazy branch-link stub's address, written into every freshly
    /// compiled block's unlinked `gbr` slots.
    pub fn link_branch_addr(&self) -> usize {
        trampoline::stub_link_branch_addr()
    }
}

impl Default for StubTable {
    fn default() -> Self {
        Self::new()
    }
}
