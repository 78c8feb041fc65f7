//! The normalized record of a VM exit.

use std::fmt;

use crate::regs::Regs;

/// What made the vCPU stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Halt,
    Mmio,
    PortIo,
    Debug,
    Shutdown,
    InternalError,
    Interrupt,
    /// Any other exit; the raw hypervisor reason is kept.
    Unknown(u32),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Halt => write!(f, "halt"),
            ExitKind::Mmio => write!(f, "mmio"),
            ExitKind::PortIo => write!(f, "portio"),
            ExitKind::Debug => write!(f, "debug"),
            ExitKind::Shutdown => write!(f, "shutdown"),
            ExitKind::InternalError => write!(f, "internal-error"),
            ExitKind::Interrupt => write!(f, "interrupt"),
            ExitKind::Unknown(r) => write!(f, "unknown({})", r),
        }
    }
}

/// Port I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Exit-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Mmio {
        phys_addr: u64,
        data: [u8; 8],
        len: u32,
        is_write: bool,
    },
    PortIo {
        direction: IoDirection,
        size: u8,
        port: u16,
        count: u32,
        data_offset: u64,
    },
    Debug {
        /// amd64: exception vector; arm64: the ESR.
        exception: u32,
        pc: u64,
        /// amd64 DR6; arm64 FAR.
        info: u64,
    },
    Shutdown {
        subtype: u32,
        flags: u64,
    },
    Internal {
        suberror: u32,
    },
    FailEntry {
        reason: u64,
    },
}

/// A VM exit, normalized across architectures.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: ExitKind,
    /// Guest address tied to the exit: the faulting PC for halt and debug,
    /// the physical address for MMIO, the port for port I/O.
    pub addr: u64,
    /// Guest PC as reported by the hypervisor.
    pub pc_at_trap: u64,
    pub payload: Payload,
    /// Registers at the exit.
    pub regs: Regs,
}

impl Fault {
    pub fn new(kind: ExitKind, addr: u64, payload: Payload, regs: Regs) -> Self {
        Self {
            kind,
            addr,
            pc_at_trap: regs.pc(),
            payload,
            regs,
        }
    }

    /// MMIO access details, if this is an MMIO exit.
    pub fn mmio(&self) -> Option<(u64, u32, bool)> {
        match self.payload {
            Payload::Mmio {
                phys_addr,
                len,
                is_write,
                ..
            } => Some((phys_addr, len, is_write)),
            _ => None,
        }
    }

    /// Value the guest tried to store, for MMIO writes.
    pub fn mmio_write_value(&self) -> Option<u64> {
        match self.payload {
            Payload::Mmio {
                data,
                len,
                is_write: true,
                ..
            } => {
                let mut b = [0u8; 8];
                let n = (len as usize).min(8);
                b[..n].copy_from_slice(&data[..n]);
                Some(u64::from_le_bytes(b))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {:#x} (pc {:#x}, sp {:#x})",
            self.kind,
            self.addr,
            self.pc_at_trap,
            self.regs.sp()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Arch;

    #[test]
    fn test_mmio_write_value_truncates_to_len() {
        let mut regs = Regs::new(Arch::X86_64);
        regs.set_pc(0x1000);
        let fault = Fault::new(
            ExitKind::Mmio,
            0xef00_0008,
            Payload::Mmio {
                phys_addr: 0xef00_0008,
                data: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
                len: 4,
                is_write: true,
            },
            regs,
        );
        assert_eq!(fault.pc_at_trap, 0x1000);
        assert_eq!(fault.mmio_write_value(), Some(0x4433_2211));
        assert_eq!(fault.mmio(), Some((0xef00_0008, 4, true)));
    }
}
