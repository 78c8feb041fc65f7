//! UEFI data definitions: status codes, GUIDs, table offsets and the
//! in-memory variable store.

pub mod guid;
pub mod status;
pub mod table;
pub mod variables;

pub use guid::Guid;
pub use status::EfiStatus;
pub use variables::{Variable, VariableStore};

/// Size of an `EFI_HANDLE` and of every table slot.
pub const POINTER_SIZE: u64 = 8;

/// `EFI_MEMORY_TYPE` values used by the memory map and allocators.
pub mod memory_type {
    pub const LOADER_CODE: u32 = 1;
    pub const LOADER_DATA: u32 = 2;
    pub const BOOT_SERVICES_CODE: u32 = 3;
    pub const BOOT_SERVICES_DATA: u32 = 4;
    pub const CONVENTIONAL: u32 = 7;
}

/// Memory attribute bits; the single descriptor we report carries them all.
pub const MEMORY_ATTRIBUTES_ALL: u64 = 0x1 | 0x2 | 0x4 | 0x8 | 0x10 | 0x1000 | 0x2000 | 0x4000;

/// `EFI_MEMORY_DESCRIPTOR`, 48 bytes including trailing padding.
#[derive(Debug, Clone, Copy, Default, zerocopy::IntoBytes, zerocopy::Immutable)]
#[repr(C)]
pub struct MemoryDescriptor {
    pub memory_type: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
    pub pad2: u64,
}

/// `EFI_TIME`.
#[derive(Debug, Clone, Copy, Default, zerocopy::IntoBytes, zerocopy::FromBytes, zerocopy::Immutable)]
#[repr(C)]
pub struct EfiTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad1: u8,
    pub nanosecond: u32,
    pub time_zone: i16,
    pub daylight: u8,
    pub pad2: u8,
}

impl EfiTime {
    /// Convert seconds since the Unix epoch (UTC).
    pub fn from_unix(secs: u64, nanos: u32) -> Self {
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;
        // Civil-from-days, proleptic Gregorian.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
        let year = (yoe + era * 400 + i64::from(month <= 2)) as u16;
        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u8,
            minute: (rem / 60 % 60) as u8,
            second: (rem % 60) as u8,
            nanosecond: nanos,
            // EFI_UNSPECIFIED_TIMEZONE
            time_zone: 0x7ff,
            ..Default::default()
        }
    }
}
