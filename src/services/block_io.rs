//! `EFI_BLOCK_IO_PROTOCOL` over a small RAM disk.
//!
//! Building the service also builds the device it sits on: a handle
//! carrying Block I/O and a device path, with the media description and
//! the path itself stored in the guest-writable part of the service's
//! table area.

use std::ops::Range;

use crate::debug_service;
use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::guid::{BLOCK_IO, DEVICE_PATH};
use crate::uefi::table::block_io::{self as op, media};
use crate::uefi::EfiStatus;

pub const NAME: &str = "BlockIo";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: Some(BLOCK_IO),
    aliases: &[],
    table_size: op::SIZE,
    create,
};

pub const BLOCK_SIZE: u32 = 512;
pub const BLOCK_COUNT: u64 = 64;
pub const MEDIA_ID: u32 = 0;

/// Media description, one page above the table.
pub const MEDIA_OFFSET: u64 = 0x1000;
/// Device path, two pages above the table.
pub const DEVICE_PATH_OFFSET: u64 = 0x2000;

/// `PciRoot(0x0)/Pci(0x0,0x7)`
pub const DEVICE_PATH_BYTES: [u8; 22] = [
    // ACPI, _HID PNP0A03, _UID 0
    0x02, 0x01, 0x0c, 0x00, 0x41, 0xd0, 0x0a, 0x03, 0x00, 0x00, 0x00, 0x00,
    // PCI function 7, device 0
    0x01, 0x01, 0x06, 0x00, 0x07, 0x00,
    // End of entire path
    0xff, 0xff, 0x04, 0x00,
];

fn create(d: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    let media_ptr = base + MEDIA_OFFSET;
    trace.write_word(base + op::REVISION, op::REVISION_VALUE)?;
    trace.write_word(base + op::MEDIA, media_ptr)?;

    trace.write(media_ptr, &[0; media::SIZE as usize])?;
    trace.write_u32(media_ptr + media::MEDIA_ID, MEDIA_ID)?;
    trace.write(media_ptr + media::MEDIA_PRESENT, &[1])?;
    trace.write(media_ptr + media::LOGICAL_PARTITION, &[1])?;
    trace.write_u32(media_ptr + media::BLOCK_SIZE, BLOCK_SIZE)?;
    trace.write_word(media_ptr + media::LAST_BLOCK, BLOCK_COUNT - 1)?;

    let path = base + DEVICE_PATH_OFFSET;
    trace.write(path, &DEVICE_PATH_BYTES)?;

    let device = d.handles_mut().create();
    d.handles_mut().put(device, BLOCK_IO, &[], base)?;
    d.handles_mut().put(device, DEVICE_PATH, &[], path)?;
    debug_service!("block device handle {:#x}, path at {:#x}", device, path);

    Ok(Box::new(BlockIo {
        base,
        disk: vec![0; (BLOCK_COUNT * u64::from(BLOCK_SIZE)) as usize],
    }))
}

struct BlockIo {
    base: u64,
    disk: Vec<u8>,
}

impl BlockIo {
    /// Byte range of the disk a transfer covers, or the status refusing it.
    fn span(
        &self,
        media_id: u64,
        lba: u64,
        size: u64,
        buffer: u64,
    ) -> std::result::Result<Range<usize>, EfiStatus> {
        if media_id as u32 != MEDIA_ID {
            return Err(EfiStatus::MediaChanged);
        }
        if buffer == 0 {
            return Err(EfiStatus::InvalidParameter);
        }
        if size % u64::from(BLOCK_SIZE) != 0 {
            return Err(EfiStatus::BadBufferSize);
        }
        let start = lba
            .checked_mul(u64::from(BLOCK_SIZE))
            .filter(|_| lba < BLOCK_COUNT)
            .ok_or(EfiStatus::InvalidParameter)?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.disk.len() as u64)
            .ok_or(EfiStatus::InvalidParameter)?;
        Ok(start as usize..end as usize)
    }

    fn transfer(&mut self, req: &mut Request<'_>, write: bool) -> Result<EfiStatus> {
        let (media_id, lba, size, buffer) = (req.arg(1)?, req.arg(2)?, req.arg(3)?, req.arg(4)?);
        if size == 0 {
            return Ok(EfiStatus::Success);
        }
        let range = match self.span(media_id, lba, size, buffer) {
            Ok(range) => range,
            Err(status) => return Ok(status),
        };
        debug_service!(
            "{} lba {:#x} size {:#x} buffer {:#x}",
            if write { "write" } else { "read" },
            lba,
            size,
            buffer
        );
        if write {
            req.trace.read(buffer, &mut self.disk[range])?;
        } else {
            req.trace.write(buffer, &self.disk[range])?;
        }
        Ok(EfiStatus::Success)
    }
}

impl Service for BlockIo {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        op::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        match offset {
            op::RESET => "Reset",
            op::READ_BLOCKS => "ReadBlocks",
            op::WRITE_BLOCKS => "WriteBlocks",
            op::FLUSH_BLOCKS => "FlushBlocks",
            _ => "field",
        }
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            op::RESET | op::FLUSH_BLOCKS => Ok(EfiStatus::Success),
            op::READ_BLOCKS => self.transfer(req, false),
            op::WRITE_BLOCKS => self.transfer(req, true),
            off => Err(Error::unsupported(format!(
                "call through block io field {:#x} at {:#x}",
                off, self.base
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::TRAP_OFFSET;
    use crate::regs::Arch;
    use crate::services::boot;
    use crate::services::testing::{self, call};
    use crate::trace::testing::FakeTrace;
    use crate::uefi::table::{boot as bs_op, search};

    const GUID_PTR: u64 = 0x2000;
    const OUT: u64 = 0x2100;
    const COUNT: u64 = 0x2108;
    const BUF: u64 = 0x3000;

    #[test]
    fn test_table_and_media() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let base = d.instantiate(&mut t, NAME).unwrap();

        assert_eq!(t.read_word(base + op::REVISION).unwrap(), op::REVISION_VALUE);
        let m = t.read_word(base + op::MEDIA).unwrap();
        assert_eq!(m, base + MEDIA_OFFSET);
        assert_eq!(
            t.read_word(base + op::READ_BLOCKS).unwrap(),
            base + op::READ_BLOCKS + TRAP_OFFSET
        );

        assert_eq!(t.read_u32(m + media::MEDIA_ID).unwrap(), MEDIA_ID);
        let mut flags = [0u8; 4];
        t.read(m + media::REMOVABLE_MEDIA, &mut flags).unwrap();
        assert_eq!(flags, [0, 1, 1, 0]);
        assert_eq!(t.read_u32(m + media::BLOCK_SIZE).unwrap(), 512);
        assert_eq!(t.read_word(m + media::LAST_BLOCK).unwrap(), BLOCK_COUNT - 1);

        let mut path = [0u8; 22];
        t.read(base + DEVICE_PATH_OFFSET, &mut path).unwrap();
        assert_eq!(path, DEVICE_PATH_BYTES);
        assert_eq!(&path[18..], &[0xff, 0xff, 0x04, 0x00]);
    }

    #[test]
    fn test_device_handle_is_found_by_guid() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, boot::NAME).unwrap();
        t.write(GUID_PTR, &BLOCK_IO.to_bytes()).unwrap();
        t.write_word(COUNT, 4).unwrap();

        // The first search builds the device.
        let args = [search::BY_PROTOCOL, GUID_PTR, 0, COUNT, OUT];
        call(&mut t, &mut d, bs, bs_op::LOCATE_HANDLE, &args);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(COUNT).unwrap(), 1);
        let device = t.read_word(OUT).unwrap();
        let base = d.instantiate(&mut t, NAME).unwrap();
        assert_ne!(device, base);
        assert_eq!(d.handles().get(device, &BLOCK_IO).unwrap(), base);

        call(&mut t, &mut d, bs, bs_op::LOCATE_PROTOCOL, &[GUID_PTR, 0, OUT]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(OUT).unwrap(), base);

        t.write(GUID_PTR, &DEVICE_PATH.to_bytes()).unwrap();
        call(&mut t, &mut d, bs, bs_op::HANDLE_PROTOCOL, &[device, GUID_PTR, OUT]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(OUT).unwrap(), base + DEVICE_PATH_OFFSET);
    }

    #[test]
    fn test_write_then_read_blocks() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let base = d.instantiate(&mut t, NAME).unwrap();
        let block: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        t.write(BUF, &block).unwrap();

        call(&mut t, &mut d, base, op::WRITE_BLOCKS, &[base, 0, 3, 512, BUF]);
        assert_eq!(t.regs.ret(), 0);

        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, 2, 1024, BUF + 0x400]);
        assert_eq!(t.regs.ret(), 0);
        let mut back = vec![0u8; 1024];
        t.read(BUF + 0x400, &mut back).unwrap();
        assert!(back[..512].iter().all(|&b| b == 0));
        assert_eq!(&back[512..], &block[..]);

        call(&mut t, &mut d, base, op::FLUSH_BLOCKS, &[base]);
        assert_eq!(t.regs.ret(), 0);
        call(&mut t, &mut d, base, op::RESET, &[base, 0]);
        assert_eq!(t.regs.ret(), 0);
    }

    #[test]
    fn test_transfer_checks() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let base = d.instantiate(&mut t, NAME).unwrap();
        let status = |t: &FakeTrace| EfiStatus::from_code(t.regs.ret());

        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, 0, 100, BUF]);
        assert_eq!(status(&t), EfiStatus::BadBufferSize);
        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 1, 0, 512, BUF]);
        assert_eq!(status(&t), EfiStatus::MediaChanged);
        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, 0, 512, 0]);
        assert_eq!(status(&t), EfiStatus::InvalidParameter);
        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, BLOCK_COUNT, 512, BUF]);
        assert_eq!(status(&t), EfiStatus::InvalidParameter);
        // Runs off the end of the disk.
        call(&mut t, &mut d, base, op::WRITE_BLOCKS, &[base, 0, BLOCK_COUNT - 1, 1024, BUF]);
        assert_eq!(status(&t), EfiStatus::InvalidParameter);
        call(&mut t, &mut d, base, op::WRITE_BLOCKS, &[base, 0, u64::MAX, u64::MAX & !511, BUF]);
        assert_eq!(status(&t), EfiStatus::InvalidParameter);

        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, BLOCK_COUNT - 1, 512, BUF]);
        assert_eq!(status(&t), EfiStatus::Success);
        call(&mut t, &mut d, base, op::READ_BLOCKS, &[base, 0, 0, 0, 0]);
        assert_eq!(status(&t), EfiStatus::Success);
    }
}
