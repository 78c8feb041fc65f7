//! `EFI_SYSTEM_TABLE` and the table header shared by the service tables.

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::table::{system, HEADER_SIZE};
use crate::uefi::EfiStatus;

pub const NAME: &str = "SystemTable";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: None,
    aliases: &[],
    table_size: system::SIZE,
    create,
};

/// UEFI 2.70
pub const REVISION: u32 = (2 << 16) | 70;

pub const FIRMWARE_VENDOR: &str = "efivm";
pub const FIRMWARE_REVISION: u32 = 0x0001_0000;

/// Where the vendor string lives, past the end of the table.
const VENDOR_OFFSET: u64 = 0x100;

const CRC32_OFFSET: u64 = 0x10;

/// Write an `EFI_TABLE_HEADER` at `base` with a zero CRC.
pub fn write_header(trace: &mut dyn Trace, base: u64, signature: u64, size: u64) -> Result<()> {
    let mut hdr = [0u8; HEADER_SIZE as usize];
    hdr[0..8].copy_from_slice(&signature.to_le_bytes());
    hdr[8..12].copy_from_slice(&REVISION.to_le_bytes());
    hdr[12..16].copy_from_slice(&(size as u32).to_le_bytes());
    trace.write(base, &hdr)
}

/// Fill in the header CRC of the `size`-byte table at `base`.
pub fn seal_table(trace: &mut dyn Trace, base: u64, size: u64) -> Result<()> {
    trace.write_u32(base + CRC32_OFFSET, 0)?;
    let mut bytes = vec![0u8; size as usize];
    trace.read(base, &mut bytes)?;
    trace.write_u32(base + CRC32_OFFSET, crc32fast::hash(&bytes))
}

/// Fill in the system table CRC once every pointer is in place.
pub fn seal(trace: &mut dyn Trace, st: u64) -> Result<()> {
    seal_table(trace, st, system::SIZE)
}

fn create(_: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    write_header(trace, base, system::SIGNATURE, system::SIZE)?;
    trace.write_ucs2(base + VENDOR_OFFSET, FIRMWARE_VENDOR)?;
    trace.write_word(base + system::FIRMWARE_VENDOR, base + VENDOR_OFFSET)?;
    trace.write_word(base + system::FIRMWARE_REVISION, u64::from(FIRMWARE_REVISION))?;
    trace.write_word(base + system::NUMBER_OF_TABLE_ENTRIES, 0)?;
    trace.write_word(base + system::CONFIGURATION_TABLE, 0)?;
    Ok(Box::new(SystemTable))
}

/// The system table holds only data; nothing in it is callable.
struct SystemTable;

impl Service for SystemTable {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        system::SIZE
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        Err(Error::unsupported(format!(
            "call through system table field {:#x}",
            req.offset()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Arch;
    use crate::services::testing;

    #[test]
    fn test_header_and_vendor() {
        let (mut t, mut d) = testing::setup(Arch::X86_64);
        let st = d.instantiate(&mut t, NAME).unwrap();
        assert_eq!(t.read_word(st).unwrap(), system::SIGNATURE);
        assert_eq!(t.read_u32(st + 12).unwrap(), system::SIZE as u32);

        let vendor = t.read_word(st + system::FIRMWARE_VENDOR).unwrap();
        assert_eq!(t.read_ucs2(vendor, 64).unwrap(), FIRMWARE_VENDOR);

        seal(&mut t, st).unwrap();
        let crc = t.read_u32(st + CRC32_OFFSET).unwrap();
        let mut bytes = vec![0u8; system::SIZE as usize];
        t.read(st, &mut bytes).unwrap();
        bytes[16..20].fill(0);
        assert_eq!(crc, crc32fast::hash(&bytes));
    }
}
