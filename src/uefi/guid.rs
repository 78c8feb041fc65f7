//! `EFI_GUID` and the protocol GUIDs efivm knows about.

use std::fmt;
use std::str::FromStr;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Error;

/// A GUID in EFI mixed-endian byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Decode 16 bytes read from guest memory.
    pub fn from_bytes(b: [u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&b[8..]);
        Self {
            data1: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            data2: u16::from_le_bytes([b[4], b[5]]),
            data3: u16::from_le_bytes([b[6], b[7]]),
            data4,
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b.copy_from_slice(self.as_bytes());
        b
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::invalid(format!("malformed GUID {:?}", s));
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5
            || [8, 4, 4, 4, 12]
                .iter()
                .zip(&parts)
                .any(|(&n, p)| p.len() != n)
        {
            return Err(bad());
        }
        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| bad())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| bad())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| bad())?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (i, b) in data4.iter_mut().enumerate() {
            *b = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| bad())?;
        }
        Ok(Self::new(data1, data2, data3, data4))
    }
}

pub const LOADED_IMAGE: Guid = Guid::new(
    0x5B1B31A1,
    0x9562,
    0x11D2,
    [0x8E, 0x3F, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B],
);

pub const SIMPLE_TEXT_INPUT: Guid = Guid::new(
    0x387477C1,
    0x69C7,
    0x11D2,
    [0x8E, 0x39, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B],
);

pub const SIMPLE_TEXT_INPUT_EX: Guid = Guid::new(
    0xDD9E7534,
    0x7762,
    0x4698,
    [0x8C, 0x14, 0xF5, 0x85, 0x17, 0xA6, 0x25, 0xAA],
);

pub const SIMPLE_TEXT_OUTPUT: Guid = Guid::new(
    0x387477C2,
    0x69C7,
    0x11D2,
    [0x8E, 0x39, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B],
);

pub const UNICODE_COLLATION: Guid = Guid::new(
    0x1D85CD7F,
    0xF43D,
    0x11D2,
    [0x9A, 0x0C, 0x00, 0x90, 0x27, 0x3F, 0xC1, 0x4D],
);

pub const UNICODE_COLLATION2: Guid = Guid::new(
    0xA4C751FC,
    0x23AE,
    0x4C3E,
    [0x92, 0xE9, 0x49, 0x64, 0xCF, 0x63, 0xF3, 0x49],
);

pub const DEVICE_PATH: Guid = Guid::new(
    0x09576E91,
    0x6D3F,
    0x11D2,
    [0x8E, 0x39, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B],
);

pub const BLOCK_IO: Guid = Guid::new(
    0x964E5B21,
    0x6459,
    0x11D2,
    [0x8E, 0x39, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B],
);

pub const GLOBAL_VARIABLE: Guid = Guid::new(
    0x8BE4DF61,
    0x93CA,
    0x11D2,
    [0xAA, 0x0D, 0x00, 0xE0, 0x98, 0x03, 0x2B, 0x8C],
);
