//! Error types for efivm.

use std::path::PathBuf;
use thiserror::Error;

use crate::fault::ExitKind;
use crate::uefi::EfiStatus;

/// Result type alias using efivm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while emulating a UEFI guest.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("hypervisor not available on this platform")]
    HypervisorNotAvailable,

    #[error("failed to open {path}")]
    OpenDevice {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported KVM API version {0} (need 12)")]
    ApiVersion(i32),

    #[cfg(target_os = "linux")]
    #[error("KVM {op} failed")]
    Kvm {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("vCPU error: {0}")]
    VcpuError(String),

    #[error("invalid emulator state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    // Configuration errors
    #[error("invalid memory size: {0:#x}")]
    InvalidMemorySize(u64),

    #[error("image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("invalid guest address: {0:#x}")]
    InvalidGuestAddress(u64),

    #[error("guest range {addr:#x}+{len:#x} crosses a region boundary")]
    CrossesRegion { addr: u64, len: usize },

    #[error("guest region at {0:#x} overlaps an existing region")]
    OverlappingRegion(u64),

    #[error("guest address {0:#x} is write protected")]
    WriteProtected(u64),

    // Dispatch errors
    #[error("no service bound at {0:#x}")]
    NoService(u64),

    #[error("service base {0:#x} registered twice")]
    DuplicateBase(u64),

    #[error("service {0:?} registered twice")]
    DuplicateRegistration(String),

    #[error("no service named {0:?}")]
    UnknownService(String),

    #[error("no protocol {guid} on handle {handle:#x}")]
    NoProtocol { handle: u64, guid: String },

    #[error("no handle {0:#x}")]
    NoHandle(u64),

    #[error("service address space exhausted")]
    ServiceSpaceExhausted,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cannot recover call site at pc {pc:#x}: {reason}")]
    Unrecoverable { pc: u64, reason: String },

    #[error("guest stopped on {kind} exit at {addr:#x} (pc {pc:#x})")]
    GuestFault { kind: ExitKind, addr: u64, pc: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The coarse error classes a fault handler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is not handled; the guest sees `EFI_UNSUPPORTED`.
    Unsupported,
    /// Arguments or guest addresses were out of range.
    InvalidParameter,
    /// No service, handle or protocol for the request.
    NotFound,
    /// The fault cannot be attributed to a service.
    Unrecoverable,
    /// The VM itself is no longer usable.
    Fatal,
}

impl ErrorKind {
    /// Status reported to the guest for errors of this kind.
    pub fn status(self) -> EfiStatus {
        match self {
            ErrorKind::Unsupported => EfiStatus::Unsupported,
            ErrorKind::InvalidParameter => EfiStatus::InvalidParameter,
            ErrorKind::NotFound => EfiStatus::NotFound,
            ErrorKind::Unrecoverable | ErrorKind::Fatal => EfiStatus::DeviceError,
        }
    }

    /// Whether the guest can be told about it and keep running.
    pub fn is_guest_visible(self) -> bool {
        matches!(
            self,
            ErrorKind::Unsupported | ErrorKind::InvalidParameter | ErrorKind::NotFound
        )
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unsupported(_) | Error::ApiVersion(_) | Error::HypervisorNotAvailable => {
                ErrorKind::Unsupported
            }
            Error::InvalidGuestAddress(_)
            | Error::CrossesRegion { .. }
            | Error::WriteProtected(_)
            | Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::NoService(_)
            | Error::NoProtocol { .. }
            | Error::NoHandle(_)
            | Error::UnknownService(_) => ErrorKind::NotFound,
            Error::Unrecoverable { .. } | Error::GuestFault { .. } => ErrorKind::Unrecoverable,
            _ => ErrorKind::Fatal,
        }
    }

    /// Shorthand for an unsupported request.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Shorthand for a bad argument.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    #[cfg(target_os = "linux")]
    pub fn kvm(op: &'static str, source: nix::Error) -> Self {
        Error::Kvm { op, source }
    }
}
