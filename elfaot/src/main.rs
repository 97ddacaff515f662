//! `elfaot`: ahead-of-time compiles every block reachable from a guest
//! ELF's entry point (plus anything a prior `elfrun` run's profile store
//! recorded as an indirect-branch target or segment entry) into a
//! `.aot.so` `elfrun --aot` can load straight into its tcache.
//!
//! CLI shape grounded the same way `elfrun`'s is — a `clap::Parser`
//! derive, `anyhow::Result` top-level `main`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rvdbt_aot::driver::compile_image;
use rvdbt_aot::writer::write_aot_object;
use rvdbt_core::profile::ProfileStore;
use rvdbt_core::state::guest_state_info;

/// Ahead-of-time compile a 32-bit RISC-V Linux binary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory the profile store (if any) and the written `.aot.so` live in.
    #[arg(long)]
    cache: PathBuf,

    /// Path to the guest ELF binary.
    #[arg(long)]
    elf: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let elf_bytes = std::fs::read(&args.elf).with_context(|| format!("reading {}", args.elf.display()))?;
    let elf = elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(&elf_bytes).context("parsing guest ELF")?;
    let load_segments: Vec<_> = elf
        .segments()
        .context("guest ELF has no program headers")?
        .iter()
        .filter(|p| p.p_type == elf::abi::PT_LOAD)
        .collect();

    let read_u32 = |gaddr: u32| -> u32 {
        for seg in &load_segments {
            let start = seg.p_vaddr as u32;
            let end = start + seg.p_filesz as u32;
            if gaddr >= start && gaddr + 4 <= end {
                let off = (seg.p_offset + (gaddr - start) as u64) as usize;
                return u32::from_le_bytes(elf_bytes[off..off + 4].try_into().unwrap());
            }
        }
        // A guest word inside bss (past `p_filesz`, still under `p_memsz`)
        // an AOT compile can legitimately reach while walking straight-line
        // code padding has no instruction meaning; it never occurs at a
        // reachable code address in a binary a real compiler produced, so
        // treat it the same as addressing past any loaded segment.
        0
    };

    let mut entries = vec![elf.ehdr.e_entry as u32];
    let mut brind_targets = Vec::new();

    let profile_path = args.cache.join("profile.bin");
    if profile_path.exists() {
        match ProfileStore::open(&profile_path, &elf_bytes) {
            Ok(profile) => {
                let mut seen_entries = profile.segment_entries();
                log::info!("elfaot: profile contributed {} segment entr(y/ies)", seen_entries.len());
                entries.append(&mut seen_entries);
                brind_targets = profile.brind_targets();
                log::info!("elfaot: profile contributed {} brind target(s)", brind_targets.len());
            }
            Err(e) => log::warn!("elfaot: ignoring profile store, {e}"),
        }
    }

    let state_info = guest_state_info();
    let regions = compile_image(&state_info, read_u32, &entries, &brind_targets, rvdbt_core::aspace::ZERO_MMU_BASE);
    log::info!("elfaot: compiled {} region(s)", regions.len());

    let object_bytes = write_aot_object(&regions);

    std::fs::create_dir_all(&args.cache).ok();
    let out_path = args
        .cache
        .join(args.elf.file_name().context("elf path has no file name")?)
        .with_extension("aot.so");
    std::fs::write(&out_path, object_bytes).with_context(|| format!("writing {}", out_path.display()))?;
    log::info!("elfaot: wrote {}", out_path.display());

    Ok(())
}
