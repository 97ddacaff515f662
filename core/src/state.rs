//! Per-guest-task CPU state and the thread-local that makes it reachable
//! from translated code, runtime stubs, and the signal handler.
//!
//! Grounded on `dbt/guest/rv32_cpu.h`'s `CPUStateImpl`/`CPUState`.

use std::cell::RefCell;
use std::ptr::NonNull;

use rvdbt_common::GAddr;

use crate::qir::{StateInfo, StateReg, VType};

pub const GPR_NUM: usize = 32;
pub const TB_MAX_INSNS: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrapNo {
    None = 0,
    UnalignedIp,
    IllegalInsn,
    Ebreak,
    Ecall,
}

impl Default for TrapNo {
    fn default() -> Self {
        TrapNo::None
    }
}

/// The rv32 guest register file plus translator-visible bookkeeping.
/// Field order matters: `qir::StateInfo` slots are offsets into this
/// struct, so `gpr` must stay first and `#[repr(C)]` must stay put.
#[repr(C)]
pub struct CpuState {
    pub gpr: [u32; GPR_NUM],
    pub ip: u32,
    pub trapno: TrapNo,

    /// Host stack pointer captured by the trampoline before entering
    /// translated code; used to unwind out of the jitted frame.
    pub sp_unwindptr: usize,

    /// Base of the guest's 4 GiB linear mapping, mirrored here from
    /// `AddressSpace::base()` so runtime stubs (atomics, the brind
    /// resolver) can turn a guest address argument into a host pointer
    /// without threading the address space through every hcall.
    pub membase: *mut u8,
}

impl CpuState {
    pub fn new() -> Self {
        CpuState {
            gpr: [0; GPR_NUM],
            ip: 0,
            trapno: TrapNo::None,
            sp_unwindptr: 0,
            membase: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn g2h(&self, gaddr: u32) -> *mut u8 {
        unsafe { self.membase.add(gaddr as usize) }
    }

    pub fn ip_gaddr(&self) -> GAddr {
        GAddr::new(self.ip)
    }

    /// Corrected reading: a trap is pending iff `trapno` is not `None`.
    pub fn is_trap_pending(&self) -> bool {
        self.trapno != TrapNo::None
    }

    pub fn raise(&mut self, trap: TrapNo) {
        self.trapno = trap;
    }

    pub fn clear_trap(&mut self) {
        self.trapno = TrapNo::None;
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<NonNull<CpuState>>> = const { RefCell::new(None) };
}

/// A guest task's CPU state, scoped to the lifetime of one `execute` call.
/// Installs itself as `CpuState::current()` for the duration and restores
/// the previous value (`None`, in practice — there is one guest task per
/// process) on drop.
pub struct CurrentGuard {
    previous: Option<NonNull<CpuState>>,
}

impl CurrentGuard {
    pub fn install(state: &mut CpuState) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(NonNull::from(state))));
        CurrentGuard { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.previous);
    }
}

/// Access to the currently executing guest task's state. Must only be
/// called from inside a `CurrentGuard::install` scope (translated code,
/// runtime stubs, and the signal handler all run within one).
pub fn current() -> Option<NonNull<CpuState>> {
    CURRENT.with(|c| *c.borrow())
}

const GPR_NAMES: [&str; GPR_NUM] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "x31",
];

/// Builds the `qir::StateInfo` the translator and register allocator
/// treat as the region's globals: one `StateReg` per guest GPR, offset
/// by the field's position in `CpuState`. `x0` is included (offset 0)
/// so `VGpr` index and guest register number stay identical, even
/// though the translator never actually reads or writes it (`gprop`
/// substitutes the constant `0` instead).
pub fn guest_state_info() -> StateInfo {
    let gpr_offset = std::mem::offset_of!(CpuState, gpr) as u16;
    let regs = (0..GPR_NUM)
        .map(|i| StateReg {
            state_offs: gpr_offset + (i * 4) as u16,
            ty: VType::I32,
            name: GPR_NAMES[i],
        })
        .collect();
    StateInfo { regs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_pending_matches_non_none() {
        let mut s = CpuState::new();
        assert!(!s.is_trap_pending());
        s.raise(TrapNo::Ecall);
        assert!(s.is_trap_pending());
        s.clear_trap();
        assert!(!s.is_trap_pending());
    }

    #[test]
    fn current_guard_installs_and_restores() {
        assert!(current().is_none());
        let mut s = CpuState::new();
        {
            let _g = CurrentGuard::install(&mut s);
            assert!(current().is_some());
        }
        assert!(current().is_none());
    }

    #[test]
    fn guest_state_info_covers_every_gpr_at_its_offset() {
        let info = guest_state_info();
        assert_eq!(info.regs.len(), GPR_NUM);
        for (i, reg) in info.regs.iter().enumerate() {
            assert_eq!(reg.state_offs as usize, i * 4);
        }
    }
}
