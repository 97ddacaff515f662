//! `elfrun`: loads a 32-bit RISC-V Linux ELF binary and runs it to
//! completion through the JIT, or (with `--aot`) primes the tcache from
//! a previously compiled `.aot.so` in `--cache` before falling back to
//! the JIT for anything the AOT image didn't cover.
//!
//! CLI shape and `anyhow`/`clap::Parser` top-level structure grounded on
//! `examples/HiSA-Team-shadowfax`'s own use of `anyhow::Result` at every
//! fallible seam, generalised to a hosted binary the way
//! `examples/NeilAllavarpu-Rasperry-Pi-OS/bootloader-server`'s
//! `clap::Parser`-derived `Args` struct does it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rvdbt_core::aspace::{AddressSpace, ZERO_MMU_BASE};
use rvdbt_core::profile::ProfileStore;
use rvdbt_core::runtime::StubTable;
use rvdbt_core::state::{CpuState, TrapNo};
use rvdbt_core::tcache::TCache;
use rvdbt_core::{execute, signals};
use rvdbt_ukernel::elf_loader;
use rvdbt_ukernel::fsmanager::FsManager;
use rvdbt_ukernel::syscall::Syscalls;

const STACK_TOP: u32 = 0xff00_0000;
const STACK_SIZE: u32 = 8 * 1024 * 1024;

/// Run a 32-bit RISC-V Linux binary under the translator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory guest filesystem syscalls are jailed under.
    #[arg(long)]
    fsroot: PathBuf,

    /// Directory the tcache's profile store and any `.aot.so` live in.
    #[arg(long)]
    cache: PathBuf,

    /// Load `<cache>/<elf-file-name>.aot.so` before falling back to the
    /// JIT for anything it doesn't cover.
    #[arg(long)]
    aot: bool,

    /// Path to the guest ELF binary.
    elf: PathBuf,

    /// Arguments passed through to the guest program's `argv`.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    std::process::exit(run(args)?);
}

fn run(args: Args) -> Result<i32> {
    let elf_bytes = std::fs::read(&args.elf).with_context(|| format!("reading {}", args.elf.display()))?;

    std::fs::create_dir_all(&args.cache).ok();
    let mut profile = match ProfileStore::open(&args.cache.join("profile.bin"), &elf_bytes) {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("elfrun: profile store unavailable, continuing without one: {e}");
            None
        }
    };

    let mut aspace = AddressSpace::new();
    let loaded = elf_loader::load(&mut aspace, &elf_bytes).context("loading guest ELF")?;

    aspace
        .mmap(Some(rvdbt_common::GAddr::new(STACK_TOP - STACK_SIZE)), STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE, -1, 0)
        .ok_or_else(|| anyhow::anyhow!("elfrun: failed to map guest stack"))?;

    let mut state = CpuState::new();
    state.membase = aspace.base();
    state.ip = loaded.entry;
    state.gpr[2] = build_initial_stack(&mut aspace, &loaded, &args.elf, &args.guest_args);

    signals::install(aspace.base(), rvdbt_core::aspace::ASPACE_SIZE as usize);

    let tcache = TCache::new();
    let stubs = StubTable::new();
    let state_info = rvdbt_core::state::guest_state_info();

    if args.aot {
        if let Some(name) = args.elf.file_name() {
            let aot_path = args.cache.join(name).with_extension("aot.so");
            if aot_path.exists() {
                match unsafe { rvdbt_aot::loader::load(&aot_path, &tcache, &stubs) } {
                    Ok(loaded_aot) => log::info!("elfrun: primed tcache with {} AOT region(s)", loaded_aot.regions_installed),
                    Err(e) => log::warn!("elfrun: AOT load failed, falling back to JIT-only: {e}"),
                }
            }
        }
    }

    let fsmgr = FsManager::new(&args.fsroot);
    let brk_base = next_page(loaded.entry.max(highest_loaded_addr(&elf_bytes).unwrap_or(loaded.entry)));
    let mut syscalls = Syscalls::new(fsmgr, brk_base);

    loop {
        let read_u32 = |gaddr: u32| -> u32 {
            let ptr = aspace.g2h(rvdbt_common::GAddr::new(gaddr)) as *const u32;
            unsafe { ptr.read_unaligned() }
        };
        execute::execute(&mut state, &tcache, &state_info, &stubs, ZERO_MMU_BASE, read_u32);

        if let Some(p) = profile.as_mut() {
            p.mark_executed(state.ip);
        }

        match state.trapno {
            TrapNo::Ecall => {
                if let Some(code) = syscalls.dispatch(&mut state, &mut aspace) {
                    if let Some(p) = profile.as_mut() {
                        flush_profile(p, &tcache);
                    }
                    break Ok(code);
                }
                state.clear_trap();
                state.ip += 4;
            }
            TrapNo::Ebreak => {
                log::info!("elfrun: guest ebreak at {:#x}", state.ip);
                if let Some(p) = profile.as_mut() {
                    flush_profile(p, &tcache);
                }
                break Ok(0);
            }
            TrapNo::IllegalInsn => {
                if let Some(p) = profile.as_mut() {
                    flush_profile(p, &tcache);
                }
                anyhow::bail!("illegal instruction at {:#x}", state.ip);
            }
            TrapNo::UnalignedIp => {
                if let Some(p) = profile.as_mut() {
                    flush_profile(p, &tcache);
                }
                anyhow::bail!("misaligned branch target {:#x}", state.ip);
            }
            TrapNo::None => unreachable!("execute() only returns with a trap pending"),
        }
    }
}

/// Walks every block the tcache still holds, ascending by guest entry
/// IP per the profile store's page-record layout, and folds each
/// block's tracked flags into its page's record. Called once at process
/// exit rather than per block as it's compiled, matching the profile
/// store's "exit-time flush" design.
fn flush_profile(profile: &mut ProfileStore, tcache: &TCache) {
    for tb in tcache.blocks() {
        let (ip, is_brind_target, is_segment_entry) = unsafe {
            let tb = tb.as_ref();
            (tb.ip, tb.flags.is_brind_target.get(), tb.flags.is_segment_entry.get())
        };
        profile.mark_executed(ip);
        if is_brind_target {
            profile.mark_brind_target(ip);
        }
        if is_segment_entry {
            profile.mark_segment_entry(ip);
        }
    }
    if let Err(e) = profile.flush() {
        log::warn!("elfrun: profile flush failed: {e}");
    }
}

fn next_page(addr: u32) -> u32 {
    rvdbt_common::page::round_up(addr as usize, rvdbt_common::page::PAGE_SIZE) as u32
}

fn highest_loaded_addr(elf_bytes: &[u8]) -> Option<u32> {
    let elf = elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(elf_bytes).ok()?;
    elf.segments()?
        .iter()
        .filter(|p| p.p_type == elf::abi::PT_LOAD)
        .map(|p| (p.p_vaddr + p.p_memsz) as u32)
        .max()
}

/// Lays out `argc`/`argv`/`envp`/auxv on the freshly mapped guest stack
/// per the standard Linux process-startup ABI, and returns the initial
/// guest `sp`.
fn build_initial_stack(
    aspace: &mut AddressSpace,
    loaded: &elf_loader::LoadedElf,
    elf_path: &std::path::Path,
    guest_args: &[String],
) -> u32 {
    let mut sp = STACK_TOP;

    let mut argv_gaddrs = Vec::new();
    let program_name = elf_path.to_string_lossy().into_owned();
    for arg in std::iter::once(program_name).chain(guest_args.iter().cloned()) {
        sp -= arg.len() as u32 + 1;
        let dst = aspace.g2h(rvdbt_common::GAddr::new(sp));
        unsafe {
            std::ptr::copy_nonoverlapping(arg.as_ptr(), dst, arg.len());
            *dst.add(arg.len()) = 0;
        }
        argv_gaddrs.push(sp);
    }

    sp &= !0xf;
    sp -= 16;
    let random_gaddr = sp;
    let random_bytes: [u8; 16] = std::array::from_fn(|_| rand_byte());
    unsafe {
        std::ptr::copy_nonoverlapping(random_bytes.as_ptr(), aspace.g2h(rvdbt_common::GAddr::new(sp)), 16);
    }

    let auxv = elf_loader::build_auxv(loaded, random_gaddr);

    // envp: empty for now beyond the NULL terminator — this workspace's
    // guest scenarios don't depend on an inherited environment.
    let layout_words = 1 + argv_gaddrs.len() + 1 + 1 + auxv.len() * 2;
    sp &= !0xf;
    sp -= layout_words as u32 * 4;
    sp &= !0xf;

    let mut cursor = sp;
    let mut write_word = |aspace: &mut AddressSpace, w: u32| {
        let dst = aspace.g2h(rvdbt_common::GAddr::new(cursor)) as *mut u32;
        unsafe { dst.write_unaligned(w) };
        cursor += 4;
    };

    write_word(aspace, argv_gaddrs.len() as u32);
    for g in &argv_gaddrs {
        write_word(aspace, *g);
    }
    write_word(aspace, 0);
    write_word(aspace, 0); // envp terminator (empty environment)
    for (tag, value) in auxv {
        write_word(aspace, tag);
        write_word(aspace, value);
    }

    sp
}

fn rand_byte() -> u8 {
    let mut b = 0u8;
    unsafe {
        libc::syscall(libc::SYS_getrandom, &mut b as *mut u8, 1usize, 0i32);
    }
    b
}
