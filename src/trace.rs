//! The traced-process view of a guest.
//!
//! Everything above the backend talks to the guest through [`Trace`]: run
//! it until the next exit, read and write its memory, and read and write
//! its registers. The KVM backend is the production implementation;
//! [`testing::FakeTrace`] scripts exits for unit tests.

use crate::error::{Error, Result};
use crate::fault::Fault;
use crate::memory::GuestMemory;
use crate::regs::{Arch, Regs};

/// A stopped-or-running guest with one vCPU.
pub trait Trace: Send {
    /// Guest architecture.
    fn arch(&self) -> Arch;

    /// Run the guest until the next exit and return it normalized.
    fn enter(&mut self) -> Result<Fault>;

    /// Trap after every instruction while `on`.
    fn single_step(&mut self, on: bool) -> Result<()>;

    fn get_regs(&mut self) -> Result<Regs>;

    fn set_regs(&mut self, regs: &Regs) -> Result<()>;

    fn memory(&self) -> &GuestMemory;

    fn memory_mut(&mut self) -> &mut GuestMemory;

    /// Finish the MMIO access that caused the last exit.
    ///
    /// `reply` is the value returned to a read. `len` is the length of the
    /// faulting instruction, for backends that leave the PC at it; KVM
    /// replays the access itself and ignores it.
    fn complete_mmio(&mut self, reply: Option<u64>, len: u64) -> Result<()>;

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.memory().read(addr, buf)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory_mut().write(addr, data)
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        self.memory().read_word(addr)
    }

    fn write_word(&mut self, addr: u64, val: u64) -> Result<()> {
        self.memory_mut().write_word(addr, val)
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&mut self, addr: u64, val: u32) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    /// Read a NUL-terminated UCS-2 string of at most `max` code units.
    fn read_ucs2(&self, addr: u64, max: usize) -> Result<String> {
        self.memory().read_ucs2(addr, max)
    }

    /// Write `s` as NUL-terminated UCS-2. Returns the bytes written.
    fn write_ucs2(&mut self, addr: u64, s: &str) -> Result<u64> {
        let bytes = ucs2_bytes(s);
        self.write(addr, &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Read the 16 bytes of a GUID.
    fn read_guid(&self, addr: u64) -> Result<crate::uefi::Guid> {
        if addr == 0 {
            return Err(Error::invalid("null GUID pointer"));
        }
        let mut b = [0u8; 16];
        self.read(addr, &mut b)?;
        Ok(crate::uefi::Guid::from_bytes(b))
    }

    /// Push a word on the guest stack.
    fn push(&mut self, regs: &mut Regs, val: u64) -> Result<()> {
        let sp = regs.sp() - 8;
        self.write_word(sp, val)?;
        regs.set_sp(sp);
        Ok(())
    }
}

/// Encode `s` as NUL-terminated little-endian UCS-2.
pub fn ucs2_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|u| u.to_le_bytes())
        .collect()
}
