//! Dispatches the fixed Linux rv32 syscall subset named in the syscall
//! surface: marshals guest argument registers to the matching host
//! syscall via `libc`, then writes the return value back to `a0`.
//!
//! Numbers are the real RISC-V Linux "generic" syscall ABI numbers (the
//! same table rv32 and rv64 share, save for the few rv32-specific
//! `*_time64` variants a 32-bit `time_t` forces). Unknown numbers panic
//! with the syscall number, per the surface's documented policy — there
//! is no graceful path for a guest that uses a syscall this subset
//! doesn't cover.

use rvdbt_common::GAddr;
use rvdbt_core::aspace::AddressSpace;
use rvdbt_core::state::CpuState;

use crate::fsmanager::FsManager;

const SYS_GETCWD: u32 = 17;
const SYS_OPENAT: u32 = 56;
const SYS_CLOSE: u32 = 57;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;
const SYS_EXIT_GROUP: u32 = 94;
const SYS_UNAME: u32 = 160;
const SYS_GETTIMEOFDAY: u32 = 169;
const SYS_PRLIMIT64: u32 = 261;
const SYS_CLOCK_GETTIME64: u32 = 403;
const SYS_STATX: u32 = 291;
const SYS_BRK: u32 = 214;
const SYS_MUNMAP: u32 = 215;
const SYS_MMAP2: u32 = 222;
const SYS_MPROTECT: u32 = 226;
const SYS_GETRANDOM: u32 = 278;

/// Guest register indices carrying the syscall number and its six
/// arguments, per the standard RISC-V Linux calling convention.
const A0: usize = 10;
const A1: usize = 11;
const A2: usize = 12;
const A3: usize = 13;
const A4: usize = 14;
const A5: usize = 15;
const A7: usize = 17;

pub struct Syscalls {
    fsmgr: FsManager,
    brk_base: u32,
    brk_cur: u32,
}

impl Syscalls {
    /// `brk_base` is the guest address right past the end of the loaded
    /// image's bss, page-rounded — the program break starts there with
    /// nothing yet mapped beyond it.
    pub fn new(fsmgr: FsManager, brk_base: u32) -> Self {
        Syscalls { fsmgr, brk_base, brk_cur: brk_base }
    }

    /// Services the syscall named by `state.gpr[A7]`, reading its
    /// arguments from `a0..a5` and leaving the result in `a0`. Called by
    /// the collaborator's `execute` loop whenever `state.trapno` is
    /// `TrapNo::Ecall`; the caller clears the trap afterwards. Returns
    /// `Some(code)` for `exit`/`exit_group` instead of terminating the
    /// process itself, so the caller gets a chance to flush the profile
    /// store before the process actually goes away.
    pub fn dispatch(&mut self, state: &mut CpuState, aspace: &mut AddressSpace) -> Option<i32> {
        let no = state.gpr[A7];
        let a0 = state.gpr[A0];
        let a1 = state.gpr[A1];
        let a2 = state.gpr[A2];
        let a3 = state.gpr[A3];
        let a4 = state.gpr[A4];
        let a5 = state.gpr[A5];

        if no == SYS_EXIT || no == SYS_EXIT_GROUP {
            return Some(a0 as i32);
        }

        let ret = match no {
            SYS_OPENAT => self.sys_openat(aspace, a0 as i32, a1, a2 as i32, a3 as i32),
            SYS_CLOSE => unsafe { libc::close(a0 as i32) as i64 },
            SYS_READ => unsafe { libc::read(a0 as i32, aspace.g2h(GAddr::new(a1)) as *mut libc::c_void, a2 as usize) as i64 },
            SYS_WRITE => unsafe { libc::write(a0 as i32, aspace.g2h(GAddr::new(a1)) as *const libc::c_void, a2 as usize) as i64 },
            SYS_GETCWD => self.sys_getcwd(aspace, a0, a1),
            SYS_BRK => self.sys_brk(aspace, a0) as i64,
            SYS_MUNMAP => {
                aspace.munmap(GAddr::new(a0), a1);
                0
            }
            SYS_MMAP2 => self.sys_mmap2(aspace, a0, a1, a2 as i32, a3 as i32, a4 as i32, a5),
            SYS_MPROTECT => unsafe {
                libc::mprotect(aspace.g2h(GAddr::new(a0)) as *mut libc::c_void, a1 as usize, a2 as i32) as i64
            },
            SYS_UNAME => self.sys_uname(aspace, a0),
            SYS_STATX => self.sys_statx(aspace, a0 as i32, a1, a2 as i32, a3 as i32, a4),
            SYS_GETRANDOM => unsafe {
                libc::syscall(libc::SYS_getrandom, aspace.g2h(GAddr::new(a0)), a1 as usize, a2 as i32) as i64
            },
            SYS_PRLIMIT64 => self.sys_prlimit64(aspace, a2, a3),
            SYS_GETTIMEOFDAY | SYS_CLOCK_GETTIME64 => self.sys_clock_gettime(aspace, a0, a1),
            other => panic!("rvdbt-ukernel: unsupported syscall number {other}"),
        };

        state.gpr[A0] = ret as u32;
        None
    }

    fn sys_openat(&self, aspace: &mut AddressSpace, dirfd: i32, path_gaddr: u32, flags: i32, mode: i32) -> i64 {
        let guest_path = unsafe { std::ffi::CStr::from_ptr(aspace.g2h(GAddr::new(path_gaddr)) as *const libc::c_char) }
            .to_string_lossy()
            .into_owned();
        let host_path = match self.fsmgr.resolve(&guest_path) {
            Ok(p) => p,
            Err(_) => return -(libc::EACCES as i64),
        };
        let c_path = std::ffi::CString::new(host_path.as_os_str().to_string_lossy().into_owned()).unwrap();
        let _ = dirfd;
        unsafe { libc::open(c_path.as_ptr(), flags, mode) as i64 }
    }

    fn sys_getcwd(&self, aspace: &mut AddressSpace, buf_gaddr: u32, size: u32) -> i64 {
        let cwd = b"/\0";
        if (size as usize) < cwd.len() {
            return -(libc::ERANGE as i64);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(cwd.as_ptr(), aspace.g2h(GAddr::new(buf_gaddr)), cwd.len());
        }
        buf_gaddr as i64
    }

    /// `brk(0)` reports the current break; any other argument sets a
    /// new one, mapping or unmapping the delta as guest anonymous
    /// memory. Matches the Linux convention of returning the resulting
    /// break either way, never an error code.
    fn sys_brk(&mut self, aspace: &mut AddressSpace, requested: u32) -> u32 {
        if requested == 0 || requested == self.brk_cur {
            return self.brk_cur;
        }
        if requested > self.brk_cur {
            let grow_from = self.brk_cur.max(self.brk_base);
            let len = requested - grow_from;
            if aspace
                .mmap(Some(GAddr::new(grow_from)), len, libc::PROT_READ | libc::PROT_WRITE, -1, 0)
                .is_none()
            {
                return self.brk_cur;
            }
        } else {
            aspace.munmap(GAddr::new(requested), self.brk_cur - requested);
        }
        self.brk_cur = requested;
        self.brk_cur
    }

    fn sys_mmap2(
        &self,
        aspace: &mut AddressSpace,
        addr: u32,
        len: u32,
        prot: i32,
        flags: i32,
        fd: i32,
        pgoffset: u32,
    ) -> i64 {
        let gaddr = if addr == 0 { None } else { Some(GAddr::new(addr)) };
        let anon_fd = if flags & libc::MAP_ANONYMOUS != 0 { -1 } else { fd };
        match aspace.mmap(gaddr, len, prot, anon_fd, (pgoffset as i64) * 4096) {
            Some(g) => g.get() as i64,
            None => -(libc::ENOMEM as i64),
        }
    }

    fn sys_uname(&self, aspace: &mut AddressSpace, buf_gaddr: u32) -> i64 {
        const FIELD: usize = 65;
        let fields: [&[u8]; 6] = [b"Linux", b"rvdbt", b"6.1.0", b"#1", b"riscv32", b""];
        let dst = aspace.g2h(GAddr::new(buf_gaddr));
        for (i, field) in fields.iter().enumerate() {
            unsafe {
                let slot = dst.add(i * FIELD);
                std::ptr::write_bytes(slot, 0, FIELD);
                std::ptr::copy_nonoverlapping(field.as_ptr(), slot, field.len());
            }
        }
        0
    }

    /// `struct statx` is a fixed-width, arch-independent Linux ABI
    /// struct (unlike `struct stat`), so the host's own layout can be
    /// copied to the guest byte for byte.
    fn sys_statx(&self, aspace: &mut AddressSpace, dirfd: i32, path_gaddr: u32, flags: i32, mask: i32, statx_gaddr: u32) -> i64 {
        let guest_path = unsafe { std::ffi::CStr::from_ptr(aspace.g2h(GAddr::new(path_gaddr)) as *const libc::c_char) }
            .to_string_lossy()
            .into_owned();
        let host_path = match self.fsmgr.resolve(&guest_path) {
            Ok(p) => p,
            Err(_) => return -(libc::EACCES as i64),
        };
        let c_path = std::ffi::CString::new(host_path.as_os_str().to_string_lossy().into_owned()).unwrap();
        let mut buf: libc::statx = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statx(dirfd, c_path.as_ptr(), flags, mask as u32, &mut buf) };
        if rc != 0 {
            return -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                &buf as *const libc::statx as *const u8,
                aspace.g2h(GAddr::new(statx_gaddr)),
                std::mem::size_of::<libc::statx>(),
            );
        }
        0
    }

    /// Reduced `prlimit64`: reports the host's own limit for the
    /// requested resource (this translator never imposes a tighter
    /// limit of its own) and ignores any requested new limit, matching
    /// the "query only" slice of the surface this workspace supports.
    fn sys_prlimit64(&self, aspace: &mut AddressSpace, _new_limit: u32, old_limit_gaddr: u32) -> i64 {
        if old_limit_gaddr == 0 {
            return 0;
        }
        let mut rlim: libc::rlimit64 = unsafe { std::mem::zeroed() };
        unsafe { libc::getrlimit64(libc::RLIMIT_STACK, &mut rlim) };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &rlim as *const libc::rlimit64 as *const u8,
                aspace.g2h(GAddr::new(old_limit_gaddr)),
                std::mem::size_of::<libc::rlimit64>(),
            );
        }
        0
    }

    /// The host's `timespec` on x86-64 already has 64-bit `tv_sec`/
    /// `tv_nsec`, the exact layout rv32's `*_time64` syscalls expect —
    /// copied through unchanged.
    fn sys_clock_gettime(&self, aspace: &mut AddressSpace, clock_id: u32, ts_gaddr: u32) -> i64 {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::clock_gettime(clock_id as i32, &mut ts) };
        if rc != 0 {
            return -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                &ts as *const libc::timespec as *const u8,
                aspace.g2h(GAddr::new(ts_gaddr)),
                std::mem::size_of::<libc::timespec>(),
            );
        }
        0
    }
}
