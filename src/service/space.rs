//! The service address space.
//!
//! The top 8 MiB below 0xff800000 hold service tables (lower half) and
//! trap cells (upper half). Every 8-byte cell starts out as a sentinel
//! whose execution traps: `hlt; ret` on amd64, `brk #0x37` on arm64. A
//! table slot `k` of the service at `base` holds `base + k + TRAP_OFFSET`,
//! so calling through it lands on a trap cell that maps straight back to
//! `(base, k)`.

use crate::error::{Error, Result};
use crate::memory::layout::{
    SERVICE_TABLE_BASE, SERVICE_TABLE_SIZE, SERVICE_TRAP_BASE, SERVICE_TRAP_SIZE, TRAP_OFFSET,
};
use crate::memory::GuestMemory;
use crate::regs::Arch;
use crate::uefi::POINTER_SIZE;

/// Bits of a service pointer that select the slot.
pub const OFFSET_MASK: u64 = 0xffff;

/// Distance between two service bases.
pub const BASE_STRIDE: u64 = OFFSET_MASK + 1;

/// `hlt; ret`
const X64_SENTINEL_CODE: u64 = 0xc3f4;
const X64_SENTINEL_TAG: u64 = 0xdead_be << 40;

/// `brk #0x37`
pub const ARM64_BRK: u32 = 0xd420_06e0;

/// A service base plus a slot offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServPtr {
    pub base: u64,
    pub offset: u64,
}

impl ServPtr {
    /// Split a guest address into base and offset.
    pub fn split(addr: u64) -> Self {
        Self {
            base: addr & !OFFSET_MASK,
            offset: addr & OFFSET_MASK,
        }
    }

    pub fn addr(&self) -> u64 {
        self.base | self.offset
    }

    /// The trap cell a table slot points at.
    pub fn trap_addr(&self) -> u64 {
        self.addr() + TRAP_OFFSET
    }
}

impl std::fmt::Display for ServPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}+{:#x}", self.base, self.offset)
    }
}

/// Whether `addr` lies in the trap half.
pub fn is_trap_addr(addr: u64) -> bool {
    (SERVICE_TRAP_BASE..SERVICE_TRAP_BASE + SERVICE_TRAP_SIZE).contains(&addr)
}

/// Map a faulting address to the service slot it stands for.
pub fn resolve(addr: u64) -> ServPtr {
    if is_trap_addr(addr) {
        ServPtr::split(addr - TRAP_OFFSET)
    } else {
        ServPtr::split(addr)
    }
}

/// The sentinel stored at `byte_index` bytes into the service space.
pub fn sentinel(arch: Arch, byte_index: u64) -> u64 {
    match arch {
        Arch::X86_64 => X64_SENTINEL_CODE | X64_SENTINEL_TAG | (byte_index << 16),
        Arch::Aarch64 => u64::from(ARM64_BRK) | (byte_index << 32),
    }
}

/// Recover the cell index from a sentinel word.
pub fn sentinel_index(arch: Arch, word: u64) -> Option<u64> {
    match arch {
        Arch::X86_64 => {
            (word & 0xffff == X64_SENTINEL_CODE && word >> 40 == X64_SENTINEL_TAG >> 40)
                .then(|| (word >> 16) & 0xff_ffff)
        }
        Arch::Aarch64 => (word as u32 == ARM64_BRK).then(|| word >> 32),
    }
}

/// Monotonic guest allocator with no free.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    next: u64,
    limit: u64,
}

impl BumpAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        Self { next: base, limit }
    }

    /// Next address to be handed out.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Carve `size` bytes aligned to `align` (a power of two).
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let start = self.next.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(size)?;
        if end > self.limit {
            return None;
        }
        self.next = end;
        Some(start)
    }
}

/// Allocation state of the service space.
#[derive(Debug)]
pub struct ServiceSpace {
    arch: Arch,
    next_base: u64,
    bump: BumpAllocator,
}

impl ServiceSpace {
    /// `bump_base..bump_limit` is the guest RAM handed out by the bump
    /// allocator.
    pub fn new(arch: Arch, bump_base: u64, bump_limit: u64) -> Self {
        Self {
            arch,
            next_base: SERVICE_TABLE_BASE,
            bump: BumpAllocator::new(bump_base, bump_limit),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Fill both halves with sentinels and make the trap half read-only
    /// for the host.
    pub fn poison(&self, mem: &mut GuestMemory) -> Result<()> {
        for (start, size) in [
            (SERVICE_TABLE_BASE, SERVICE_TABLE_SIZE),
            (SERVICE_TRAP_BASE, SERVICE_TRAP_SIZE),
        ] {
            let mut cells = Vec::with_capacity(size as usize);
            for addr in (start..start + size).step_by(POINTER_SIZE as usize) {
                let word = sentinel(self.arch, addr - SERVICE_TABLE_BASE);
                cells.extend_from_slice(&word.to_le_bytes());
            }
            mem.write(start, &cells)?;
        }
        mem.protect(SERVICE_TRAP_BASE, SERVICE_TRAP_SIZE)
    }

    /// Hand out the next 64 KiB aligned service base.
    pub fn alloc_base(&mut self) -> Result<u64> {
        if self.next_base >= SERVICE_TABLE_BASE + SERVICE_TABLE_SIZE {
            return Err(Error::ServiceSpaceExhausted);
        }
        let base = self.next_base;
        self.next_base += BASE_STRIDE;
        Ok(base)
    }

    /// Point every slot of a `size`-byte table at its trap cell.
    pub fn fill_table(&self, mem: &mut GuestMemory, base: u64, size: u64) -> Result<()> {
        let mut table = Vec::with_capacity(size as usize);
        for k in (0..size).step_by(POINTER_SIZE as usize) {
            let slot = ServPtr { base, offset: k };
            table.extend_from_slice(&slot.trap_addr().to_le_bytes());
        }
        mem.write(base, &table)
    }

    pub fn bump(&mut self) -> &mut BumpAllocator {
        &mut self.bump
    }

    pub fn bump_next(&self) -> u64 {
        self.bump.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout;

    fn service_memory() -> GuestMemory {
        let mut mem = GuestMemory::new();
        mem.add_region(
            layout::SLOT_SERVICE_TABLES,
            SERVICE_TABLE_BASE,
            SERVICE_TABLE_SIZE,
        )
        .unwrap();
        mem.add_region(layout::SLOT_SERVICE_TRAPS, SERVICE_TRAP_BASE, SERVICE_TRAP_SIZE)
            .unwrap();
        mem
    }

    #[test]
    fn test_split_properties() {
        for addr in [0xff00_0000u64, 0xff01_0048, 0xef00_0000, 0xffff_ffff] {
            let p = ServPtr::split(addr);
            assert_eq!(p.base & 0xffff, 0);
            assert!(p.offset < 0x1_0000);
            assert_eq!(p.addr(), addr);
        }
        let trap = ServPtr { base: 0xff02_0000, offset: 0x98 }.trap_addr();
        assert_eq!(trap, 0xff42_0098);
        assert_eq!(resolve(trap), ServPtr { base: 0xff02_0000, offset: 0x98 });
    }

    #[test]
    fn test_poisoned_cell_decodes() {
        let mut mem = service_memory();
        let space = ServiceSpace::new(Arch::X86_64, 0x4000_0000, 0x8000_0000);
        space.poison(&mut mem).unwrap();

        let word = mem.read_word(0xff00_0060).unwrap();
        assert_eq!(word & 0xffff, 0xc3f4);
        assert_eq!(sentinel_index(Arch::X86_64, word), Some(0x60));

        let trap = mem.read_word(SERVICE_TRAP_BASE).unwrap();
        assert_eq!(sentinel_index(Arch::X86_64, trap), Some(TRAP_OFFSET));
    }

    #[test]
    fn test_trap_half_is_read_only_after_poison() {
        let mut mem = service_memory();
        let space = ServiceSpace::new(Arch::Aarch64, 0x4000_0000, 0x8000_0000);
        space.poison(&mut mem).unwrap();

        for addr in [SERVICE_TRAP_BASE, SERVICE_TRAP_BASE + 0x1238, 0xff7f_fff8] {
            assert!(matches!(
                mem.write_word(addr, 0),
                Err(Error::WriteProtected(_))
            ));
        }
        let word = mem.read_word(0xff40_0010).unwrap();
        assert_eq!(word as u32, ARM64_BRK);
        assert_eq!(word >> 32, 0x40_0010);
        // The table half stays writable.
        mem.write_word(SERVICE_TABLE_BASE, 1).unwrap();
    }

    #[test]
    fn test_tables_point_at_traps() {
        let mut mem = service_memory();
        let mut space = ServiceSpace::new(Arch::X86_64, 0x4000_0000, 0x8000_0000);
        let a = space.alloc_base().unwrap();
        let b = space.alloc_base().unwrap();
        assert_eq!((a, b), (0xff00_0000, 0xff01_0000));

        space.fill_table(&mut mem, b, 0x20).unwrap();
        assert_eq!(mem.read_word(b + 0x18).unwrap(), b + 0x18 + TRAP_OFFSET);
    }

    #[test]
    fn test_bases_run_out() {
        let mut space = ServiceSpace::new(Arch::X86_64, 0, 0);
        for _ in 0..64 {
            space.alloc_base().unwrap();
        }
        assert!(matches!(
            space.alloc_base(),
            Err(Error::ServiceSpaceExhausted)
        ));
    }

    #[test]
    fn test_bump_allocator() {
        let mut bump = BumpAllocator::new(0x4000_0000, 0x4000_1000);
        assert_eq!(bump.alloc(0x40, 8), Some(0x4000_0000));
        assert_eq!(bump.next(), 0x4000_0040);
        assert_eq!(bump.alloc(0x80, 8), Some(0x4000_0040));
        assert_eq!(bump.next(), 0x4000_00c0);
        assert_eq!(bump.alloc(0x10, 0x1000), None);
        assert_eq!(bump.alloc(0x10, 0x100), Some(0x4000_0100));
    }
}
