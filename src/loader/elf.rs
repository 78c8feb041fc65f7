//! Static ELF64 executables.

use object::elf::{FileHeader64, EM_AARCH64, EM_X86_64, PT_LOAD};
use object::read::elf::{FileHeader, ProgramHeader};
use object::LittleEndian as LE;

use super::{ImageFormat, ImageInfo, MemoryWriter};
use crate::error::{Error, Result};
use crate::memory::layout::ARM64_ELF_STACK_TOP;
use crate::regs::Arch;

fn machine_for(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => EM_X86_64,
        Arch::Aarch64 => EM_AARCH64,
    }
}

/// Copy every PT_LOAD segment to its physical address.
pub fn load(data: &[u8], arch: Arch, memory: &mut impl MemoryWriter) -> Result<ImageInfo> {
    let bad = |e: object::read::Error| Error::InvalidImage(format!("ELF: {}", e));

    let ehdr = FileHeader64::<LE>::parse(data).map_err(bad)?;
    let machine = ehdr.e_machine(LE);
    if machine != machine_for(arch) {
        return Err(Error::InvalidImage(format!(
            "ELF machine {} does not match {}",
            machine, arch
        )));
    }

    let mut lowest = u64::MAX;
    let mut highest = 0u64;
    for phdr in ehdr.program_headers(LE, data).map_err(bad)? {
        if phdr.p_type(LE) != PT_LOAD {
            continue;
        }
        let paddr = phdr.p_paddr(LE);
        let memsz = phdr.p_memsz(LE);
        let file = phdr.data(LE, data).map_err(|_| {
            Error::InvalidImage(format!("ELF segment at {:#x} runs past end of file", paddr))
        })?;
        if file.len() as u64 > memsz {
            return Err(Error::InvalidImage(format!(
                "ELF segment at {:#x} has filesz > memsz",
                paddr
            )));
        }

        log::debug!("segment {:#x} ({:#x} bytes, {:#x} from file)", paddr, memsz, file.len());
        memory.zero(paddr, memsz)?;
        memory.write(paddr, file)?;

        lowest = lowest.min(paddr);
        highest = highest.max(paddr + memsz);
    }

    if lowest > highest {
        return Err(Error::InvalidImage("ELF has no loadable segments".into()));
    }

    Ok(ImageInfo {
        format: ImageFormat::Elf,
        entry: ehdr.e_entry(LE),
        image_base: lowest,
        image_size: highest - lowest,
        heap_base: highest,
        stack_top: ARM64_ELF_STACK_TOP,
    })
}
