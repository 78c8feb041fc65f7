//! PE32+ images.

use object::pe::{IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_ARM64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile64};
use object::LittleEndian as LE;

use super::{ImageFormat, ImageInfo, MemoryWriter};
use crate::error::{Error, Result};
use crate::regs::Arch;

fn machine_for(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => IMAGE_FILE_MACHINE_AMD64,
        Arch::Aarch64 => IMAGE_FILE_MACHINE_ARM64,
    }
}

/// Map every section of `data` at its preferred image base.
///
/// The image is not relocated. Execution starts at the base of code.
pub fn load(data: &[u8], arch: Arch, memory: &mut impl MemoryWriter) -> Result<ImageInfo> {
    let pe = PeFile64::parse(data).map_err(|e| Error::InvalidImage(format!("PE: {}", e)))?;
    let nt = pe.nt_headers();

    let machine = nt.file_header().machine.get(LE);
    if machine != machine_for(arch) {
        return Err(Error::InvalidImage(format!(
            "PE machine {:#x} does not match {}",
            machine, arch
        )));
    }

    let opt = nt.optional_header();
    let image_base = opt.image_base();
    let image_size = u64::from(opt.size_of_image());

    memory.zero(image_base, image_size)?;

    for section in pe.section_table().iter() {
        let va = u64::from(section.virtual_address.get(LE));
        let vsize = section.virtual_size.get(LE) as usize;
        let raw = section
            .pe_data(data)
            .map_err(|e| Error::InvalidImage(format!("PE section: {}", e)))?;
        let len = if vsize == 0 { raw.len() } else { raw.len().min(vsize) };
        if len == 0 {
            continue;
        }
        log::debug!(
            "section {} -> {:#x} ({:#x} bytes)",
            String::from_utf8_lossy(section.raw_name()),
            image_base + va,
            len
        );
        memory.write(image_base + va, &raw[..len])?;
    }

    let heap_base = image_base + image_size;
    let stack_top = heap_base + opt.size_of_heap_reserve() + opt.size_of_stack_reserve();

    Ok(ImageInfo {
        format: ImageFormat::Pe,
        entry: image_base + u64::from(opt.base_of_code()),
        image_base,
        image_size,
        heap_base,
        stack_top,
    })
}
