//! Guest memory regions and the memory map that owns them.

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};

/// One slot of guest physical memory backed by an anonymous host mapping.
#[derive(Debug)]
pub struct GuestRegion {
    /// Hypervisor memory slot
    pub slot: u32,
    /// Guest physical address
    pub guest_addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Host mapping
    ptr: *mut u8,
}

impl GuestRegion {
    fn map(slot: u32, guest_addr: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidMemorySize(size));
        }
        guest_addr
            .checked_add(size)
            .ok_or(Error::InvalidGuestAddress(guest_addr))?;

        // SAFETY: anonymous mapping with a null hint; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap of {:#x} bytes for slot {} failed: {}",
                size,
                slot,
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            slot,
            guest_addr,
            size,
            ptr: ptr as *mut u8,
        })
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr - self.guest_addr < self.size
    }

    /// Get the offset of an address within this region.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_addr)
        } else {
            None
        }
    }

    /// Last guest address (exclusive).
    pub fn end(&self) -> u64 {
        self.guest_addr + self.size
    }

    /// Host address of the backing buffer, for binding to the hypervisor.
    pub fn host_addr(&self) -> u64 {
        self.ptr as u64
    }

    fn overlaps(&self, guest_addr: u64, size: u64) -> bool {
        guest_addr < self.end() && self.guest_addr < guest_addr + size
    }
}

impl Drop for GuestRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size come from the successful mmap in `map`.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size as usize);
            }
        }
    }
}

/// The guest physical address space: an ordered set of non-overlapping
/// regions plus the ranges the host refuses to write.
#[derive(Debug, Default)]
pub struct GuestMemory {
    regions: Vec<GuestRegion>,
    protected: Vec<(u64, u64)>,
}

// Safety: GuestMemory owns its mappings; the single worker thread is the only
// writer while the vCPU is stopped.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Create an empty memory map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a fresh zeroed buffer of `size` bytes at `guest_addr`.
    pub fn add_region(&mut self, slot: u32, guest_addr: u64, size: u64) -> Result<&GuestRegion> {
        if self
            .regions
            .iter()
            .any(|r| r.slot == slot || r.overlaps(guest_addr, size))
        {
            return Err(Error::OverlappingRegion(guest_addr));
        }
        let region = GuestRegion::map(slot, guest_addr, size)?;
        let pos = self
            .regions
            .iter()
            .position(|r| r.guest_addr > guest_addr)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
        Ok(&self.regions[pos])
    }

    /// All regions, lowest guest address first.
    pub fn regions(&self) -> &[GuestRegion] {
        &self.regions
    }

    /// The region holding `addr`, if any.
    pub fn region(&self, addr: u64) -> Option<&GuestRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Resolve `[addr, addr+len)` to a host pointer inside one region.
    fn host_ptr(&self, addr: u64, len: usize) -> Result<*mut u8> {
        let region = self
            .region(addr)
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let offset = addr - region.guest_addr;
        if offset + len as u64 > region.size {
            return Err(Error::CrossesRegion { addr, len });
        }
        // SAFETY: offset is within the mapping checked above.
        Ok(unsafe { region.ptr.add(offset as usize) })
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let src = self.host_ptr(addr, buf.len())?;
        // SAFETY: host_ptr validated that buf.len() bytes are mapped.
        unsafe {
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write bytes to a guest physical address.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if let Some(&(start, _)) = self.protected.iter().find(|&&(start, end)| {
            addr < end && start < addr + data.len() as u64
        }) {
            return Err(Error::WriteProtected(addr.max(start)));
        }
        let dst = self.host_ptr(addr, data.len())?;
        // SAFETY: host_ptr validated that data.len() bytes are mapped.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Read a little-endian u64.
    pub fn read_word(&self, addr: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Write a little-endian u64.
    pub fn write_word(&mut self, addr: u64, val: u64) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    /// Read a plain-data value.
    pub fn read_obj<T: FromBytes + Sized>(&self, addr: u64) -> Result<T> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read(addr, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| Error::InvalidGuestAddress(addr))
    }

    /// Write a plain-data value.
    pub fn write_obj<T: IntoBytes + Immutable>(&mut self, addr: u64, val: &T) -> Result<()> {
        self.write(addr, val.as_bytes())
    }

    /// Fill `[addr, addr+len)` with `byte`.
    pub fn fill(&mut self, addr: u64, len: u64, byte: u8) -> Result<()> {
        if self.protected.iter().any(|&(s, e)| addr < e && s < addr + len) {
            return Err(Error::WriteProtected(addr));
        }
        let dst = self.host_ptr(addr, len as usize)?;
        // SAFETY: host_ptr validated the range.
        unsafe { std::ptr::write_bytes(dst, byte, len as usize) };
        Ok(())
    }

    /// Make `[addr, addr+len)` read-only for the host.
    ///
    /// The range must be page aligned and lie in a single region. Later
    /// writes through this map fail with [`Error::WriteProtected`].
    pub fn protect(&mut self, addr: u64, len: u64) -> Result<()> {
        let ptr = self.host_ptr(addr, len as usize)?;
        // SAFETY: the range is mapped; mprotect only narrows permissions.
        let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len as usize, libc::PROT_READ) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        self.protected.push((addr, addr + len));
        Ok(())
    }

    /// Whether a host write at `addr` would be refused.
    pub fn is_protected(&self, addr: u64) -> bool {
        self.protected.iter().any(|&(s, e)| addr >= s && addr < e)
    }

    /// Read a NUL-terminated UCS-2 string (at most `max` code units).
    pub fn read_ucs2(&self, addr: u64, max: usize) -> Result<String> {
        let mut units = Vec::new();
        let mut p = addr;
        while units.len() < max {
            let mut b = [0u8; 2];
            self.read(p, &mut b)?;
            let u = u16::from_le_bytes(b);
            if u == 0 {
                break;
            }
            units.push(u);
            p += 2;
        }
        Ok(String::from_utf16_lossy(&units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_read_write() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0, 0x20_0000).unwrap();

        let data = b"Hello, EFI!";
        mem.write(0x10_0000, data).unwrap();

        let mut buf = [0u8; 11];
        mem.read(0x10_0000, &mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_round_trip_at_region_edges() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0, 0x1000).unwrap();
        mem.add_region(1, 0xffff_0000, 0x1_0000).unwrap();

        for &addr in &[0u64, 0xff8, 0xffff_0000, 0xffff_fff8] {
            mem.write_word(addr, addr ^ 0x5a5a).unwrap();
            assert_eq!(mem.read_word(addr).unwrap(), addr ^ 0x5a5a);
        }
    }

    #[test]
    fn test_crossing_or_missing_fails() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0, 0x1000).unwrap();
        mem.add_region(1, 0x1000, 0x1000).unwrap();

        let err = mem.write(0xffc, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::CrossesRegion { .. }));
        let err = mem.write_word(0x2000, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidGuestAddress(0x2000)));
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0x1000, 0x2000).unwrap();
        assert!(mem.add_region(1, 0x2000, 0x1000).is_err());
        assert!(mem.add_region(0, 0x8000, 0x1000).is_err());
        mem.add_region(1, 0x3000, 0x1000).unwrap();
        assert_eq!(mem.regions().len(), 2);
    }

    #[test]
    fn test_protected_range_refuses_writes() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0, 0x4000).unwrap();
        mem.write_word(0x2000, 0xc3f4).unwrap();
        mem.protect(0x2000, 0x2000).unwrap();

        assert!(matches!(
            mem.write_word(0x2008, 0),
            Err(Error::WriteProtected(_))
        ));
        // Straddling writes are refused too.
        assert!(mem.write(0x1ffc, &[0u8; 8]).is_err());
        assert_eq!(mem.read_word(0x2000).unwrap(), 0xc3f4);
        mem.write_word(0x1000, 7).unwrap();
    }

    #[test]
    fn test_obj_and_ucs2() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, 0, 0x1000).unwrap();
        mem.write_obj(0x10, &0xDEADBEEFu32).unwrap();
        assert_eq!(mem.read_obj::<u32>(0x10).unwrap(), 0xDEADBEEF);

        let s: Vec<u8> = "Hi!\0".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        mem.write(0x100, &s).unwrap();
        assert_eq!(mem.read_ucs2(0x100, 64).unwrap(), "Hi!");
    }
}
