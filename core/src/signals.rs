//! Process-wide SIGSEGV/SIGBUS handling.
//!
//! Grounded on `dbt/guest/rv32_cpu.cpp`'s fault handler: classify the
//! fault address against the guest's 4 GiB window and report it, then
//! stop. Both outcomes in the design's error table — a fault inside the
//! window (a guest bug the translator didn't catch) and a fault outside
//! it (a host bug in this crate) — are fatal; neither is something a
//! signal handler can safely turn into a resumable `Result`, so this
//! never longjmps back into execution. It only ever runs once, right
//! before the process goes down.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::state;

static ASPACE_BASE: AtomicUsize = AtomicUsize::new(0);
static ASPACE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Registers the fatal handler for SIGSEGV and SIGBUS and records the
/// guest address space window so the handler can classify a fault.
/// Must be called once, after `AddressSpace::new()`, before `execute`
/// runs any translated code.
pub fn install(aspace_base: *mut u8, aspace_size: usize) {
    ASPACE_BASE.store(aspace_base as usize, Ordering::SeqCst);
    ASPACE_SIZE.store(aspace_size, Ordering::SeqCst);

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut());
    }
}

/// Writes `msg` then `val` in hex, then a newline, to stderr with raw
/// `write(2)` calls only — no allocation, no formatting machinery that
/// might itself fault or deadlock inside a signal handler.
fn write_fatal_line(msg: &[u8], val: usize) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
    let mut buf = [0u8; 18];
    buf[0] = b'0';
    buf[1] = b'x';
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for i in 0..16 {
        let shift = (15 - i) * 4;
        buf[2 + i] = HEX[((val >> shift) & 0xf) as usize];
    }
    unsafe {
        libc::write(2, buf.as_ptr() as *const libc::c_void, buf.len());
        libc::write(2, b"\n".as_ptr() as *const libc::c_void, 1);
    }
}

/// Writes `rvdbt: xNN=0x...` for guest GPR `idx`, same raw-`write(2)`
/// constraints as `write_fatal_line` — `idx` is at most 31, so two ASCII
/// digits are always enough.
fn write_fatal_reg(idx: usize, val: usize) {
    let mut label = [0u8; 8];
    label[0] = b'x';
    let n = if idx >= 10 {
        label[1] = b'0' + (idx / 10) as u8;
        label[2] = b'0' + (idx % 10) as u8;
        label[3] = b'=';
        4
    } else {
        label[1] = b'0' + idx as u8;
        label[2] = b'=';
        3
    };
    unsafe {
        libc::write(2, b"rvdbt: ".as_ptr() as *const libc::c_void, 7);
        libc::write(2, label.as_ptr() as *const libc::c_void, n);
    }
    let mut buf = [0u8; 18];
    buf[0] = b'0';
    buf[1] = b'x';
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for i in 0..16 {
        let shift = (15 - i) * 4;
        buf[2 + i] = HEX[((val >> shift) & 0xf) as usize];
    }
    unsafe {
        libc::write(2, buf.as_ptr() as *const libc::c_void, buf.len());
        libc::write(2, b"\n".as_ptr() as *const libc::c_void, 1);
    }
}

extern "C" fn handler(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let fault = unsafe { (*info).si_addr() as usize };
    let base = ASPACE_BASE.load(Ordering::SeqCst);
    let size = ASPACE_SIZE.load(Ordering::SeqCst);
    let in_guest = fault.wrapping_sub(base) < size;

    if in_guest {
        let cur = state::current();
        let pc = cur.map(|s| unsafe { s.as_ref().ip } as usize).unwrap_or(0);
        write_fatal_line(b"rvdbt: guest segv, pc=", pc);
        write_fatal_line(b"rvdbt: fault address=", fault);
        if let Some(s) = cur {
            let gpr = unsafe { s.as_ref().gpr };
            for (i, reg) in gpr.iter().enumerate() {
                write_fatal_reg(i, *reg as usize);
            }
        }
    } else {
        write_fatal_line(b"rvdbt: host segv, fault address=", fault);
    }

    unsafe {
        libc::signal(_sig, libc::SIG_DFL);
        libc::raise(_sig);
    }
}
