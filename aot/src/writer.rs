//! Packages compiled regions into a real ELF shared object via the
//! `object` crate's writer, in the layout `rvdbt-core`'s design calls
//! for: a single executable `.aot` section holding every region's code
//! back to back, an `_aot_tab` symbol pointing at a small header/array
//! describing where each region landed, one `_x<hex gip>` symbol per
//! publishable region, and a parallel `_aot_patch_tab` carrying the
//! branch-slot/stub-call patch sites the loader must resolve before any
//! of this code can run.

use object::write::{Object, StandardSegment, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use crate::driver::CompiledRegion;

const PATCH_BRANCH_SLOT: u8 = 0;
const PATCH_HCALL: u8 = 1;
const PATCH_BRIND: u8 = 2;

/// Builds the `.aot.so` bytes for `regions`. `base_gip` is used only to
/// order the emitted symbols; it carries no other meaning.
pub fn write_aot_object(regions: &[CompiledRegion]) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let aot_section = obj.add_section(
        obj.segment_name(StandardSegment::Text).to_vec(),
        b".aot".to_vec(),
        SectionKind::Text,
    );

    let mut code = Vec::new();
    let mut offsets = Vec::with_capacity(regions.len());
    for region in regions {
        offsets.push(code.len() as u64);
        code.extend_from_slice(&region.code);
    }
    let code_offset = obj.append_section_data(aot_section, &code, 16);

    // Every record's `code_offset` below is absolute within `.aot`, not
    // relative to the region it came from. At load time `libloading`
    // only hands back resolved symbol addresses, not a section base, so
    // `_aot_tab` carries its own offset (`tab_self_offset`) alongside
    // its data: the loader computes `section_base = tab_host_addr -
    // tab_self_offset` once and adds every `code_offset` onto that.
    // Both tables' offsets are computed here by hand (rather than read
    // back from `append_section_data`'s return value after the fact)
    // since nothing but the object itself can report them early enough
    // to embed `tab_self_offset` inside the very data it describes.
    fn align_up(offset: u64, align: u64) -> u64 {
        (offset + align - 1) & !(align - 1)
    }

    let mut patch_tab = Vec::new();
    let mut n_patch_records = 0u64;
    for (region, &region_off) in regions.iter().zip(&offsets) {
        for slot in &region.branch_slots {
            patch_tab.push(PATCH_BRANCH_SLOT);
            patch_tab.extend_from_slice(&[0u8; 3]); // reserved, alignment
            patch_tab.extend_from_slice(&((code_offset + region_off + slot.code_offset as u64) as u32).to_le_bytes());
            patch_tab.extend_from_slice(&slot.gip.to_le_bytes());
            n_patch_records += 1;
        }
        for call in &region.stub_calls {
            let kind = if call.stub_id == u32::MAX { PATCH_BRIND } else { PATCH_HCALL };
            patch_tab.push(kind);
            patch_tab.extend_from_slice(&[0u8; 3]);
            patch_tab.extend_from_slice(&((code_offset + region_off + call.code_offset as u64) as u32).to_le_bytes());
            patch_tab.extend_from_slice(&call.stub_id.to_le_bytes());
            n_patch_records += 1;
        }
    }
    let mut patch_tab_with_count = n_patch_records.to_le_bytes().to_vec();
    patch_tab_with_count.extend_from_slice(&patch_tab);
    let patch_tab_offset = align_up(code_offset + code.len() as u64, 8);
    let written = obj.append_section_data(aot_section, &patch_tab_with_count, 8);
    debug_assert_eq!(written, patch_tab_offset);

    // `_aot_tab`: `tab_self_offset: u64`, `n_sym: u64`, then `n_sym`
    // `AOTSymbol { gip: u32, _pad: u32, code_offset: u64 }` records —
    // `code_offset` is absolute within `.aot`, exactly like the patch
    // table's.
    let tab_offset = align_up(patch_tab_offset + patch_tab_with_count.len() as u64, 8);
    let mut sym_tab = tab_offset.to_le_bytes().to_vec();
    sym_tab.extend_from_slice(&(regions.len() as u64).to_le_bytes());
    for (region, &region_off) in regions.iter().zip(&offsets) {
        sym_tab.extend_from_slice(&region.gip.to_le_bytes());
        sym_tab.extend_from_slice(&0u32.to_le_bytes());
        sym_tab.extend_from_slice(&(code_offset + region_off).to_le_bytes());
    }
    let written = obj.append_section_data(aot_section, &sym_tab, 8);
    debug_assert_eq!(written, tab_offset);

    obj.add_symbol(Symbol {
        name: b"_aot_tab".to_vec(),
        value: tab_offset,
        size: sym_tab.len() as u64,
        kind: SymbolKind::Data,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(aot_section),
        flags: SymbolFlags::None,
    });
    obj.add_symbol(Symbol {
        name: b"_aot_patch_tab".to_vec(),
        value: patch_tab_offset,
        size: patch_tab.len() as u64,
        kind: SymbolKind::Data,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(aot_section),
        flags: SymbolFlags::None,
    });

    for (region, &region_off) in regions.iter().zip(&offsets) {
        if !region.publish_symbol {
            continue;
        }
        obj.add_symbol(Symbol {
            name: format!("_x{:x}", region.gip).into_bytes(),
            value: code_offset + region_off,
            size: region.code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(aot_section),
            flags: SymbolFlags::None,
        });
    }

    obj.write().expect("object writer: serialising .aot.so failed")
}
