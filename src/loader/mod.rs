//! EFI application loading.
//!
//! Handles PE32+ images (the normal EFI application format) and static
//! ELF64 executables. Both are parsed with the `object` crate and written
//! into guest memory through [`MemoryWriter`].

pub mod elf;
pub mod pe;

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::regs::Arch;

/// Sink for image bytes.
pub trait MemoryWriter {
    /// Write `data` at guest physical address `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `addr`.
    fn zero(&mut self, addr: u64, len: u64) -> Result<()>;
}

impl MemoryWriter for GuestMemory {
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        GuestMemory::write(self, addr, data)
    }

    fn zero(&mut self, addr: u64, len: u64) -> Result<()> {
        self.fill(addr, len, 0)
    }
}

/// Image file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// PE32+ with an `MZ` stub
    Pe,
    /// ELF64
    Elf,
    /// Anything else
    Unknown,
}

/// Where an image landed and how to start it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    /// Entry point address
    pub entry: u64,
    /// Lowest loaded address
    pub image_base: u64,
    /// Bytes from `image_base` to the end of the image
    pub image_size: u64,
    /// First address past the image
    pub heap_base: u64,
    /// Initial stack pointer
    pub stack_top: u64,
}

/// Loads an EFI image for one architecture.
pub struct ImageLoader {
    data: Vec<u8>,
    arch: Arch,
}

impl ImageLoader {
    /// Read the image at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ImageNotFound(path.to_path_buf()));
        }
        Ok(Self::from_bytes(fs::read(path)?))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            arch: Arch::host(),
        }
    }

    /// Expect an image built for `arch` (default: the host).
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Detect the format from the file magic.
    pub fn detect_format(&self) -> ImageFormat {
        if self.data.starts_with(b"MZ") {
            ImageFormat::Pe
        } else if self.data.starts_with(b"\x7fELF") {
            ImageFormat::Elf
        } else {
            ImageFormat::Unknown
        }
    }

    /// Write the image into guest memory.
    pub fn load(&self, memory: &mut impl MemoryWriter) -> Result<ImageInfo> {
        match self.detect_format() {
            ImageFormat::Pe => pe::load(&self.data, self.arch, memory),
            ImageFormat::Elf => elf::load(&self.data, self.arch, memory),
            ImageFormat::Unknown => Err(Error::InvalidImage(
                "neither a PE (MZ) nor an ELF image".into(),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal well-formed images.

    /// A PE32+ EFI application with one `.text` section holding `code`.
    pub fn tiny_pe(machine: u16, image_base: u64, code: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 0x400];
        f[0..2].copy_from_slice(b"MZ");
        f[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        f[0x40..0x44].copy_from_slice(b"PE\0\0");

        // COFF file header
        let coff = 0x44;
        f[coff..coff + 2].copy_from_slice(&machine.to_le_bytes());
        f[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
        f[coff + 16..coff + 18].copy_from_slice(&240u16.to_le_bytes());
        f[coff + 18..coff + 20].copy_from_slice(&0x22u16.to_le_bytes());

        // Optional header
        let opt = coff + 20;
        let put32 = |f: &mut Vec<u8>, off: usize, v: u32| {
            f[opt + off..opt + off + 4].copy_from_slice(&v.to_le_bytes())
        };
        let put64 = |f: &mut Vec<u8>, off: usize, v: u64| {
            f[opt + off..opt + off + 8].copy_from_slice(&v.to_le_bytes())
        };
        f[opt..opt + 2].copy_from_slice(&0x20bu16.to_le_bytes());
        put32(&mut f, 4, 0x200); // SizeOfCode
        put32(&mut f, 16, 0x1000); // AddressOfEntryPoint
        put32(&mut f, 20, 0x1000); // BaseOfCode
        put64(&mut f, 24, image_base);
        put32(&mut f, 32, 0x1000); // SectionAlignment
        put32(&mut f, 36, 0x200); // FileAlignment
        put32(&mut f, 56, 0x3000); // SizeOfImage
        put32(&mut f, 60, 0x200); // SizeOfHeaders
        f[opt + 68..opt + 70].copy_from_slice(&10u16.to_le_bytes());
        put64(&mut f, 72, 0x8000); // SizeOfStackReserve
        put64(&mut f, 88, 0x4000); // SizeOfHeapReserve
        put32(&mut f, 108, 16);

        // Section table
        let sec = opt + 240;
        f[sec..sec + 5].copy_from_slice(b".text");
        f[sec + 8..sec + 12].copy_from_slice(&(code.len() as u32).to_le_bytes());
        f[sec + 12..sec + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        f[sec + 16..sec + 20].copy_from_slice(&0x200u32.to_le_bytes());
        f[sec + 20..sec + 24].copy_from_slice(&0x200u32.to_le_bytes());
        f[sec + 36..sec + 40].copy_from_slice(&0x6000_0020u32.to_le_bytes());

        f[0x200..0x200 + code.len()].copy_from_slice(code);
        f
    }

    /// A static ELF64 executable with one PT_LOAD segment.
    pub fn tiny_elf(machine: u16, paddr: u64, code: &[u8], memsz: u64) -> Vec<u8> {
        let mut f = vec![0u8; 0x78];
        f[0..4].copy_from_slice(b"\x7fELF");
        f[4] = 2; // ELFCLASS64
        f[5] = 1; // little endian
        f[6] = 1; // EV_CURRENT
        f[16..18].copy_from_slice(&2u16.to_le_bytes());
        f[18..20].copy_from_slice(&machine.to_le_bytes());
        f[20..24].copy_from_slice(&1u32.to_le_bytes());
        f[24..32].copy_from_slice(&paddr.to_le_bytes());
        f[32..40].copy_from_slice(&64u64.to_le_bytes());
        f[52..54].copy_from_slice(&64u16.to_le_bytes());
        f[54..56].copy_from_slice(&56u16.to_le_bytes());
        f[56..58].copy_from_slice(&1u16.to_le_bytes());
        f[58..60].copy_from_slice(&64u16.to_le_bytes());

        let ph = 64;
        f[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        f[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes());
        f[ph + 8..ph + 16].copy_from_slice(&0x78u64.to_le_bytes());
        f[ph + 16..ph + 24].copy_from_slice(&paddr.to_le_bytes());
        f[ph + 24..ph + 32].copy_from_slice(&paddr.to_le_bytes());
        f[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        f[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
        f[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        f.extend_from_slice(code);
        f
    }
}
