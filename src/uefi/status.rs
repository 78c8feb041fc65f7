//! `EFI_STATUS` values.

use std::fmt;

/// High bit marking an error status as seen by the guest.
pub const ERROR_BIT: u64 = 1 << 63;

/// UEFI status codes. Host records keep the bare code; [`EfiStatus::to_guest`]
/// adds the error bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EfiStatus {
    Success,
    LoadError,
    InvalidParameter,
    Unsupported,
    BadBufferSize,
    BufferTooSmall,
    NotReady,
    DeviceError,
    WriteProtected,
    OutOfResources,
    MediaChanged,
    NotFound,
    AccessDenied,
    Timeout,
    NotStarted,
    AlreadyStarted,
    Aborted,
    SecurityViolation,
    EndOfMedia,
    Other(u64),
}

impl EfiStatus {
    /// Bare status code without the error bit.
    pub fn code(self) -> u64 {
        match self {
            EfiStatus::Success => 0,
            EfiStatus::LoadError => 1,
            EfiStatus::InvalidParameter => 2,
            EfiStatus::Unsupported => 3,
            EfiStatus::BadBufferSize => 4,
            EfiStatus::BufferTooSmall => 5,
            EfiStatus::NotReady => 6,
            EfiStatus::DeviceError => 7,
            EfiStatus::WriteProtected => 8,
            EfiStatus::OutOfResources => 9,
            EfiStatus::MediaChanged => 13,
            EfiStatus::NotFound => 14,
            EfiStatus::AccessDenied => 15,
            EfiStatus::Timeout => 18,
            EfiStatus::NotStarted => 19,
            EfiStatus::AlreadyStarted => 20,
            EfiStatus::Aborted => 21,
            EfiStatus::SecurityViolation => 26,
            EfiStatus::EndOfMedia => 28,
            EfiStatus::Other(c) => c & !ERROR_BIT,
        }
    }

    /// Value written into the guest's return register.
    pub fn to_guest(self) -> u64 {
        match self {
            EfiStatus::Success => 0,
            s => s.code() | ERROR_BIT,
        }
    }

    /// Decode a guest status value (error bit optional).
    pub fn from_code(raw: u64) -> Self {
        match raw & !ERROR_BIT {
            0 => EfiStatus::Success,
            1 => EfiStatus::LoadError,
            2 => EfiStatus::InvalidParameter,
            3 => EfiStatus::Unsupported,
            4 => EfiStatus::BadBufferSize,
            5 => EfiStatus::BufferTooSmall,
            6 => EfiStatus::NotReady,
            7 => EfiStatus::DeviceError,
            8 => EfiStatus::WriteProtected,
            9 => EfiStatus::OutOfResources,
            13 => EfiStatus::MediaChanged,
            14 => EfiStatus::NotFound,
            15 => EfiStatus::AccessDenied,
            18 => EfiStatus::Timeout,
            19 => EfiStatus::NotStarted,
            20 => EfiStatus::AlreadyStarted,
            21 => EfiStatus::Aborted,
            26 => EfiStatus::SecurityViolation,
            28 => EfiStatus::EndOfMedia,
            c => EfiStatus::Other(c),
        }
    }

    pub fn is_error(self) -> bool {
        self != EfiStatus::Success
    }
}

impl fmt::Display for EfiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EfiStatus::Success => "EFI_SUCCESS",
            EfiStatus::LoadError => "EFI_LOAD_ERROR",
            EfiStatus::InvalidParameter => "EFI_INVALID_PARAMETER",
            EfiStatus::Unsupported => "EFI_UNSUPPORTED",
            EfiStatus::BadBufferSize => "EFI_BAD_BUFFER_SIZE",
            EfiStatus::BufferTooSmall => "EFI_BUFFER_TOO_SMALL",
            EfiStatus::NotReady => "EFI_NOT_READY",
            EfiStatus::DeviceError => "EFI_DEVICE_ERROR",
            EfiStatus::WriteProtected => "EFI_WRITE_PROTECTED",
            EfiStatus::OutOfResources => "EFI_OUT_OF_RESOURCES",
            EfiStatus::MediaChanged => "EFI_MEDIA_CHANGED",
            EfiStatus::NotFound => "EFI_NOT_FOUND",
            EfiStatus::AccessDenied => "EFI_ACCESS_DENIED",
            EfiStatus::Timeout => "EFI_TIMEOUT",
            EfiStatus::NotStarted => "EFI_NOT_STARTED",
            EfiStatus::AlreadyStarted => "EFI_ALREADY_STARTED",
            EfiStatus::Aborted => "EFI_ABORTED",
            EfiStatus::SecurityViolation => "EFI_SECURITY_VIOLATION",
            EfiStatus::EndOfMedia => "EFI_END_OF_MEDIA",
            EfiStatus::Other(c) => return write!(f, "EFIERR {}", c),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_encoding() {
        assert_eq!(EfiStatus::Success.to_guest(), 0);
        assert_eq!(EfiStatus::NotFound.to_guest(), 0x8000_0000_0000_000e);
        assert_eq!(EfiStatus::from_code(0x8000_0000_0000_0003), EfiStatus::Unsupported);
        assert_eq!(EfiStatus::from_code(28), EfiStatus::EndOfMedia);
        assert_eq!(EfiStatus::Other(42).to_string(), "EFIERR 42");
    }
}
