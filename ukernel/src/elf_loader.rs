//! Guest ELF loading: map every `PT_LOAD` segment into the guest address
//! space and work out the auxv entries a freshly started rv32 process
//! expects to find on its stack.
//!
//! Grounded on `examples/HiSA-Team-shadowfax`'s own `load_elf` (its
//! `src/main.rs`, under the `embed-elf` feature): walk `PT_LOAD` program
//! headers with the `elf` crate, copy file bytes in, zero the bss tail.
//! That version copies straight into physical RAM since it is firmware
//! running at a fixed load address; here the destination is a guest
//! virtual address inside `rvdbt_core::aspace::AddressSpace`'s 4 GiB
//! window, so each segment goes through `AddressSpace::mmap` first.

use elf::abi::{PF_W, PF_X, PT_LOAD};
use elf::endian::AnyEndian;
use elf::ElfBytes;

use rvdbt_common::page::{round_down, round_up, PAGE_SIZE};
use rvdbt_common::GAddr;
use rvdbt_core::aspace::AddressSpace;

use crate::error::UkernelError;

pub const AT_NULL: u32 = 0;
pub const AT_PHDR: u32 = 3;
pub const AT_PHENT: u32 = 4;
pub const AT_PHNUM: u32 = 5;
pub const AT_PAGESZ: u32 = 6;
pub const AT_ENTRY: u32 = 9;
pub const AT_RANDOM: u32 = 25;

pub struct LoadedElf {
    pub entry: u32,
    pub phdr: u32,
    pub phent: u16,
    pub phnum: u16,
}

fn prot_of(flags: u32) -> i32 {
    let mut prot = libc::PROT_READ;
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Maps every `PT_LOAD` segment of `data` into `aspace` and returns the
/// entry point plus the values a loader needs to build `AT_PHDR`/
/// `AT_PHENT`/`AT_PHNUM` auxv entries.
pub fn load(aspace: &mut AddressSpace, data: &[u8]) -> Result<LoadedElf, UkernelError> {
    let elf = ElfBytes::<AnyEndian>::minimal_parse(data)
        .map_err(|e| UkernelError::ElfParse(e.to_string()))?;
    let segments = elf.segments().ok_or(UkernelError::NoLoadSegments)?;
    let load_phdrs: Vec<_> = segments.iter().filter(|p| p.p_type == PT_LOAD).collect();
    if load_phdrs.is_empty() {
        return Err(UkernelError::NoLoadSegments);
    }

    for phdr in &load_phdrs {
        let vaddr_start = round_down(phdr.p_vaddr as usize, PAGE_SIZE) as u32;
        let vaddr_end = round_up((phdr.p_vaddr + phdr.p_memsz) as usize, PAGE_SIZE) as u32;
        let len = vaddr_end - vaddr_start;

        // Mapped writable first so the segment data and the bss zero
        // fill can land; dropped back to the segment's real permissions
        // once both are in place.
        aspace
            .mmap(Some(GAddr::new(vaddr_start)), len, libc::PROT_READ | libc::PROT_WRITE, -1, 0)
            .ok_or_else(|| UkernelError::ElfParse("segment mmap failed".into()))?;

        let p_offset = phdr.p_offset as usize;
        let p_filesz = phdr.p_filesz as usize;
        let file_bytes = data
            .get(p_offset..p_offset + p_filesz)
            .ok_or_else(|| UkernelError::ElfParse("segment data out of bounds".into()))?;

        let dst = aspace.g2h(GAddr::new(phdr.p_vaddr as u32));
        unsafe {
            std::ptr::copy_nonoverlapping(file_bytes.as_ptr(), dst, p_filesz);
            let bss_len = phdr.p_memsz as usize - p_filesz;
            if bss_len > 0 {
                std::ptr::write_bytes(dst.add(p_filesz), 0, bss_len);
            }
        }

        let final_prot = prot_of(phdr.p_flags);
        if final_prot != libc::PROT_READ | libc::PROT_WRITE {
            let rc = unsafe {
                libc::mprotect(aspace.g2h(GAddr::new(vaddr_start)) as *mut libc::c_void, len as usize, final_prot)
            };
            if rc != 0 {
                return Err(UkernelError::ElfParse("mprotect after load failed".into()));
            }
        }
    }

    let phdr_vaddr = segments
        .iter()
        .find(|p| p.p_type == elf::abi::PT_PHDR)
        .map(|p| p.p_vaddr as u32)
        .unwrap_or_else(|| load_phdrs[0].p_vaddr as u32 + elf.ehdr.e_phoff as u32);

    Ok(LoadedElf {
        entry: elf.ehdr.e_entry as u32,
        phdr: phdr_vaddr,
        phent: elf.ehdr.e_phentsize,
        phnum: elf.ehdr.e_phnum,
    })
}

/// Builds the auxv `(tag, value)` pairs a freshly started rv32 process
/// finds above its argv/envp on the stack, terminated by `AT_NULL`.
/// `random` is the 16-byte seed `AT_RANDOM` points at — the caller has
/// already copied it onto the guest stack and passes back its address.
pub fn build_auxv(loaded: &LoadedElf, random_gaddr: u32) -> Vec<(u32, u32)> {
    vec![
        (AT_PHDR, loaded.phdr),
        (AT_PHENT, loaded.phent as u32),
        (AT_PHNUM, loaded.phnum as u32),
        (AT_PAGESZ, PAGE_SIZE as u32),
        (AT_ENTRY, loaded.entry),
        (AT_RANDOM, random_gaddr),
        (AT_NULL, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_bytes() {
        let mut aspace = AddressSpace::new();
        let err = load(&mut aspace, b"not an elf file at all").unwrap_err();
        assert!(matches!(err, UkernelError::ElfParse(_)));
    }
}
