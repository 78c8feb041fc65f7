//! Guest physical memory.
//!
//! [`GuestMemory`] owns the host buffers backing each memory slot and
//! provides reads and writes by guest physical address. The backend binds
//! the same buffers to the hypervisor.

mod guest;

pub use guest::{GuestMemory, GuestRegion};

/// Guest physical memory layout shared by both architectures.
pub mod layout {
    /// Low RAM starts at guest physical 0.
    pub const LOW_RAM_START: u64 = 0;

    /// Default size of low RAM (2 GiB).
    pub const DEFAULT_LOW_RAM_SIZE: u64 = 0x8000_0000;

    /// Default base of the bump allocator used by AllocatePool/AllocatePages.
    pub const DEFAULT_BUMP_BASE: u64 = 0x4000_0000;

    /// Identity-map page tables (amd64).
    pub const PAGE_TABLE_BASE: u64 = 0xffff_0000;
    pub const PAGE_TABLE_SIZE: u64 = 0x1_0000;

    /// Service tables. Guests read and write these directly.
    pub const SERVICE_TABLE_BASE: u64 = 0xff00_0000;
    pub const SERVICE_TABLE_SIZE: u64 = 0x40_0000;

    /// Trap cells. Every slot pointer lands in here; executing one traps.
    pub const SERVICE_TRAP_BASE: u64 = 0xff40_0000;
    pub const SERVICE_TRAP_SIZE: u64 = 0x40_0000;

    /// Distance from a service slot to its trap cell.
    pub const TRAP_OFFSET: u64 = SERVICE_TRAP_BASE - SERVICE_TABLE_BASE;

    /// Trap cell the entry point returns into. A guest that gets here has
    /// returned from its entry point.
    pub const ENTRY_RETURN_TRAP: u64 = SERVICE_TRAP_BASE + SERVICE_TRAP_SIZE - 8;

    /// Anything above this address belongs to the service space.
    pub const SERVICE_WATERMARK: u64 = SERVICE_TABLE_BASE;

    /// Initial stack top for ELF images on arm64.
    pub const ARM64_ELF_STACK_TOP: u64 = 0x20_0000;

    /// Memory slot numbers.
    pub const SLOT_LOW_RAM: u32 = 0;
    pub const SLOT_PAGE_TABLES: u32 = 1;
    pub const SLOT_SERVICE_TABLES: u32 = 2;
    pub const SLOT_SERVICE_TRAPS: u32 = 3;
}
