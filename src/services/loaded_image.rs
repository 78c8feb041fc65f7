//! `EFI_LOADED_IMAGE_PROTOCOL`.
//!
//! Laid out at the very first service base. Everything but `Unload` is
//! plain data describing the image that was loaded.

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::guid::LOADED_IMAGE;
use crate::uefi::memory_type;
use crate::uefi::table::loaded_image as li;
use crate::uefi::EfiStatus;

pub const NAME: &str = "LoadedImage";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: Some(LOADED_IMAGE),
    aliases: &[],
    table_size: li::SIZE,
    create,
};

fn create(d: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    let (image_base, image_size) = d
        .image()
        .map(|i| (i.image_base, i.image_size))
        .unwrap_or((0, 0));

    // Every field but Unload is data.
    for off in (li::REVISION..li::UNLOAD).step_by(8) {
        trace.write_word(base + off, 0)?;
    }
    trace.write_word(base + li::REVISION, li::REVISION_VALUE)?;
    trace.write_word(base + li::IMAGE_BASE, image_base)?;
    trace.write_word(base + li::IMAGE_SIZE, image_size)?;
    trace.write_u32(base + li::IMAGE_CODE_TYPE, memory_type::LOADER_CODE)?;
    trace.write_u32(base + li::IMAGE_DATA_TYPE, memory_type::LOADER_DATA)?;

    Ok(Box::new(LoadedImage { base }))
}

struct LoadedImage {
    base: u64,
}

impl Service for LoadedImage {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        li::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        match offset {
            li::UNLOAD => "Unload",
            _ => "field",
        }
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            // Nothing to tear down: the image goes away with the VM.
            li::UNLOAD => Ok(EfiStatus::Success),
            off => Err(Error::unsupported(format!(
                "call through loaded image field {:#x} at {:#x}",
                off, self.base
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{SERVICE_TABLE_BASE, TRAP_OFFSET};
    use crate::regs::Arch;
    use crate::services::testing;

    #[test]
    fn test_fields_from_image() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        d.set_image(testing::image());
        let base = d.instantiate(&mut t, NAME).unwrap();
        assert_eq!(base, SERVICE_TABLE_BASE);

        assert_eq!(t.read_u32(base + li::REVISION).unwrap(), 0x1000);
        assert_eq!(t.read_word(base + li::PARENT_HANDLE).unwrap(), 0);
        assert_eq!(t.read_word(base + li::IMAGE_BASE).unwrap(), 0x10_0000);
        assert_eq!(t.read_word(base + li::IMAGE_SIZE).unwrap(), 0x3000);
        assert_eq!(t.read_u32(base + li::IMAGE_DATA_TYPE).unwrap(), memory_type::LOADER_DATA);
        assert_eq!(
            t.read_word(base + li::UNLOAD).unwrap(),
            base + li::UNLOAD + TRAP_OFFSET
        );
    }
}
