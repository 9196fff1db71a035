//! ELF loader used by `exec`: validates an ELF64 little-endian RISC-V
//! executable and installs its PT_LOAD segments in the active address
//! space.

use crate::error::{Errno, KResult};
use crate::memory::{MemoryManager, Pte, USER_END_VMA, USER_START_VMA};
use ember_machine::Memory;
use goblin::elf::header::{EM_RISCV, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::debug;

/// Load `image` into the active space; returns the entry point.
/// Segments outside the user range are silently skipped. The caller is
/// responsible for having freed any previous user mappings.
pub fn load_elf(mm: &mut MemoryManager, mem: &mut dyn Memory, image: &[u8]) -> KResult<u64> {
    let elf = Elf::parse(image).map_err(|_| Errno::BadFmt)?;

    if !elf.is_64
        || !elf.little_endian
        || elf.header.e_machine != EM_RISCV
        || elf.header.e_type != ET_EXEC
    {
        return Err(Errno::BadFmt);
    }

    for ph in elf.program_headers.iter() {
        if ph.p_type != PT_LOAD {
            continue;
        }
        let vaddr = ph.p_vaddr;
        let memsz = ph.p_memsz;
        if vaddr < USER_START_VMA || vaddr + memsz > USER_END_VMA {
            debug!("skipping segment at {vaddr:#x} outside the user range");
            continue;
        }

        let file_start = ph.p_offset as usize;
        let file_end = file_start + ph.p_filesz as usize;
        if file_end > image.len() {
            return Err(Errno::BadFmt);
        }

        // Map writable for the copy; the pages come back zeroed, which
        // covers the .bss tail.
        mm.alloc_and_map_range(mem, vaddr, memsz, Pte::R | Pte::W);
        mm.copy_to_active(mem, vaddr, &image[file_start..file_end])?;

        let mut flags = Pte::U;
        if ph.p_flags & PF_R != 0 {
            flags |= Pte::R;
        }
        if ph.p_flags & PF_W != 0 {
            flags |= Pte::W;
        }
        if ph.p_flags & PF_X != 0 {
            flags |= Pte::X;
        }
        mm.set_range_flags(mem, vaddr, memsz, flags);
        debug!(
            "loaded segment {:#x}..{:#x} ({:?})",
            vaddr,
            vaddr + memsz,
            flags
        );
    }

    Ok(elf.header.e_entry)
}
