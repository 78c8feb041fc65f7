//! # efivm
//!
//! Run EFI applications on KVM with the UEFI services emulated on the
//! host.
//!
//! There is no firmware in the guest. The system table and every
//! protocol the application sees are tables of pointers into a reserved
//! service address space; calling through one of them traps out of the
//! guest, and the host decodes the call, runs the service and resumes
//! the guest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use efivm::{Emulator, Result};
//!
//! fn main() -> Result<()> {
//!     let mut emu = Emulator::builder()
//!         .image("hello.efi")
//!         .build()?;
//!
//!     let code = emu.run()?;
//!     println!("guest exited with {}", code);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: KVM on amd64 and arm64

mod builder;
pub mod debug;
mod error;
pub mod runtime;
mod vm;

pub mod backend;
pub mod decode;
pub mod fault;
pub mod loader;
pub mod memory;
pub mod regs;
pub mod service;
pub mod services;
pub mod trace;
pub mod uefi;

// Re-exports
pub use builder::EmulatorBuilder;
pub use error::{Error, ErrorKind, Result};
pub use fault::{ExitKind, Fault, Payload};
pub use regs::{Arch, Regs};
pub use runtime::{EmulatorRuntime, Event, RunEnd, RuntimeHandle};
pub use trace::Trace;
pub use vm::{BootOptions, Emulator, EmulatorState, StepOutcome};

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor is available and can be used.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend for the current platform.
///
/// Returns `None` if no backend is available.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
