//! Instruction recovery.
//!
//! Given a fault, work out which guest instruction caused it and what it
//! was trying to do with the service slot: call through it, load it or
//! store to it. Nothing here writes guest state.

pub mod arm64;
pub mod x86;

use crate::error::{Error, Result};
use crate::fault::{ExitKind, Fault};
use crate::regs::Arch;
use crate::service::space::is_trap_addr;
use crate::trace::Trace;

/// What the guest did to a service slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Indirect call through the slot.
    Call,
    /// Read of the slot into general purpose register `dst`.
    Load { dst: u8 },
    /// Write to the slot.
    Store,
}

/// A decoded trap site.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub op: Op,
    /// Address of the instruction that touched the slot.
    pub site: u64,
    /// Its length in bytes.
    pub len: u64,
    /// Disassembly, for logs.
    pub text: String,
    /// Whether the instruction already ran to completion, leaving a return
    /// address on the stack (amd64) or in the link register (arm64).
    pub returned_into_trap: bool,
}

impl std::fmt::Display for Recovered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}: {}", self.site, self.text)
    }
}

/// Decode the instruction behind `fault`.
pub fn recover(trace: &dyn Trace, fault: &Fault) -> Result<Recovered> {
    let arch = fault.regs.arch();
    match (fault.kind, arch) {
        (ExitKind::Halt, Arch::X86_64) if is_trap_addr(fault.addr) => {
            x86::call_site(trace, &fault.regs)
        }
        (ExitKind::Debug, Arch::Aarch64) if is_trap_addr(fault.addr) => {
            arm64::call_site(trace, &fault.regs)
        }
        (ExitKind::Mmio, _) => {
            let is_write = fault.mmio().map(|(_, _, w)| w).unwrap_or(false);
            match arch {
                Arch::X86_64 => x86::decode_access(trace, &fault.regs, is_write),
                Arch::Aarch64 => arm64::decode_access(trace, &fault.regs, is_write),
            }
        }
        _ => Err(Error::Unrecoverable {
            pc: fault.pc_at_trap,
            reason: format!("{} exit is not a service access", fault.kind),
        }),
    }
}
