//! Loads a `.aot.so` written by `writer::write_aot_object` back into the
//! running process and turns its regions into injected `TBlock`s the
//! tcache can serve without ever calling the JIT compiler.
//!
//! Grounded on the design's "the runtime side loads it with
//! `libloading::Library` and reads `_aot_tab`" note: `dlopen` maps the
//! `.aot` section RWX (ELF program header flags carry that through),
//! after which the code is no different from anything the JIT emitted —
//! it just skips translation entirely. Branch-slot and hcall-stub sites
//! are patched against this process's own `StubTable` right after load,
//! via the same `patch_code` the JIT compiler uses.

use libloading::Library;

use rvdbt_core::compile::patch_code;
use rvdbt_core::qcg::emit::{PendingBranchSlot, PendingStubCall};
use rvdbt_core::runtime::StubTable;
use rvdbt_core::tcache::TCache;
use rvdbt_core::DbtError;

const PATCH_BRANCH_SLOT: u8 = 0;
const PATCH_HCALL: u8 = 1;
const PATCH_BRIND: u8 = 2;
const PATCH_RECORD_SIZE: usize = 12;

/// Keeps the `Library` alive for as long as the process may call into
/// the code it mapped — dropping it would unmap the `.aot` section out
/// from under every injected `TBlock`.
pub struct LoadedAot {
    _library: Library,
    pub regions_installed: usize,
}

unsafe fn read_u64(base: *const u8, offset: usize) -> u64 {
    u64::from_le_bytes(std::slice::from_raw_parts(base.add(offset), 8).try_into().unwrap())
}

unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    u32::from_le_bytes(std::slice::from_raw_parts(base.add(offset), 4).try_into().unwrap())
}

/// # Safety
/// `path` must name a `.aot.so` produced by `writer::write_aot_object`
/// for this same `rvdbt-core` build — the patch table's record layout
/// and the stub ABI are not versioned.
pub unsafe fn load(path: &std::path::Path, tcache: &TCache, stubs: &StubTable) -> Result<LoadedAot, DbtError> {
    let library = Library::new(path).map_err(|e| DbtError::AotLoadFailure(e.to_string()))?;

    let tab_base: *const u8 = *library
        .get::<*const u8>(b"_aot_tab\0")
        .map_err(|e| DbtError::AotLoadFailure(e.to_string()))?;
    let patch_base: *const u8 = *library
        .get::<*const u8>(b"_aot_patch_tab\0")
        .map_err(|e| DbtError::AotLoadFailure(e.to_string()))?;

    // `_aot_tab`'s own offset within `.aot`, written by `writer` into
    // its own header, lets us recover the section's host load base
    // from this one resolved symbol address without needing the
    // section's own base from `libloading` (which doesn't expose it).
    let tab_self_offset = read_u64(tab_base, 0);
    let section_base = tab_base.sub(tab_self_offset as usize);

    let n_sym = read_u64(tab_base, 8) as usize;
    for i in 0..n_sym {
        let rec_off = 16 + i * 16;
        let gip = read_u32(tab_base, rec_off);
        let code_offset = read_u64(tab_base, rec_off + 8);

        let tb = tcache.allocate_tblock(gip);
        tb.as_ref().tcode_ptr.set(section_base.add(code_offset as usize) as *mut u8);
        tcache.insert(tb);
    }

    let (branch_slots, stub_calls) = parse_patch_table(patch_base);
    patch_code(section_base as *mut u8, &branch_slots, &stub_calls, stubs);

    Ok(LoadedAot { _library: library, regions_installed: n_sym })
}

/// Walks `_aot_patch_tab`'s leading record count and then its fixed
/// `PATCH_RECORD_SIZE`-byte records, splitting them into branch-slot and
/// stub-call patch descriptions ready for `patch_code`.
unsafe fn parse_patch_table(patch_base: *const u8) -> (Vec<PendingBranchSlot>, Vec<PendingStubCall>) {
    let n_records = read_u64(patch_base, 0) as usize;

    let mut branch_slots = Vec::new();
    let mut stub_calls = Vec::new();
    for i in 0..n_records {
        let rec_off = 8 + i * PATCH_RECORD_SIZE;
        let kind = *patch_base.add(rec_off);
        let code_offset = read_u32(patch_base, rec_off + 4) as usize;
        let payload = read_u32(patch_base, rec_off + 8);

        match kind {
            PATCH_BRANCH_SLOT => branch_slots.push(PendingBranchSlot { code_offset, gip: payload }),
            PATCH_HCALL => stub_calls.push(PendingStubCall { code_offset, stub_id: payload }),
            PATCH_BRIND => stub_calls.push(PendingStubCall { code_offset, stub_id: u32::MAX }),
            _ => unreachable!("aot patch table: unknown record kind {kind}"),
        }
    }
    (branch_slots, stub_calls)
}
