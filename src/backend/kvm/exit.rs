//! Turning `kvm_run` exits into [`Fault`]s.

use kvm_bindings::*;

use crate::fault::{ExitKind, IoDirection, Payload};
use crate::regs::Arch;

/// Classify a `kvm_run.exit_reason`.
pub fn kind_for(reason: u32) -> ExitKind {
    match reason {
        KVM_EXIT_HLT => ExitKind::Halt,
        KVM_EXIT_MMIO => ExitKind::Mmio,
        KVM_EXIT_IO => ExitKind::PortIo,
        KVM_EXIT_DEBUG => ExitKind::Debug,
        KVM_EXIT_SHUTDOWN | KVM_EXIT_SYSTEM_EVENT => ExitKind::Shutdown,
        KVM_EXIT_INTERNAL_ERROR | KVM_EXIT_FAIL_ENTRY => ExitKind::InternalError,
        KVM_EXIT_INTR => ExitKind::Interrupt,
        other => ExitKind::Unknown(other),
    }
}

/// The address a fault is about: the halting instruction, the MMIO
/// physical address, the port, or the PC of a debug exit.
pub fn fault_addr(arch: Arch, kind: ExitKind, payload: &Payload, pc: u64) -> u64 {
    match (kind, payload) {
        // hlt has already retired.
        (ExitKind::Halt, _) if arch == Arch::X86_64 => pc.wrapping_sub(1),
        (_, Payload::Mmio { phys_addr, .. }) => *phys_addr,
        (_, Payload::PortIo { port, .. }) => u64::from(*port),
        (_, Payload::Debug { pc: at, .. }) if *at != 0 => *at,
        _ => pc,
    }
}

/// Copy the exit-specific data out of `run`.
///
/// # Safety
///
/// `run` must be the `kvm_run` page of a vCPU that just returned from
/// `KVM_RUN`, so that the union member for `exit_reason` is the live one.
pub unsafe fn payload(run: &kvm_run) -> Payload {
    // SAFETY: each arm reads the union member that exit_reason selects.
    unsafe {
        match run.exit_reason {
            KVM_EXIT_MMIO => {
                let mmio = &run.__bindgen_anon_1.mmio;
                Payload::Mmio {
                    phys_addr: mmio.phys_addr,
                    data: mmio.data,
                    len: mmio.len,
                    is_write: mmio.is_write != 0,
                }
            }
            KVM_EXIT_IO => {
                let io = &run.__bindgen_anon_1.io;
                Payload::PortIo {
                    direction: if u32::from(io.direction) == KVM_EXIT_IO_IN {
                        IoDirection::In
                    } else {
                        IoDirection::Out
                    },
                    size: io.size,
                    port: io.port,
                    count: io.count,
                    data_offset: io.data_offset,
                }
            }
            KVM_EXIT_DEBUG => {
                let arch = &run.__bindgen_anon_1.debug.arch;
                #[cfg(target_arch = "x86_64")]
                {
                    Payload::Debug {
                        exception: arch.exception,
                        pc: arch.pc,
                        info: arch.dr6,
                    }
                }
                #[cfg(target_arch = "aarch64")]
                {
                    Payload::Debug {
                        exception: arch.hsr,
                        pc: 0,
                        info: arch.far,
                    }
                }
            }
            KVM_EXIT_SYSTEM_EVENT => Payload::Shutdown {
                subtype: run.__bindgen_anon_1.system_event.type_,
                flags: 0,
            },
            KVM_EXIT_INTERNAL_ERROR => Payload::Internal {
                suberror: run.__bindgen_anon_1.internal.suberror,
            },
            KVM_EXIT_FAIL_ENTRY => Payload::FailEntry {
                reason: run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason,
            },
            _ => Payload::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reasons() {
        assert_eq!(kind_for(5), ExitKind::Halt);
        assert_eq!(kind_for(6), ExitKind::Mmio);
        assert_eq!(kind_for(2), ExitKind::PortIo);
        assert_eq!(kind_for(4), ExitKind::Debug);
        assert_eq!(kind_for(8), ExitKind::Shutdown);
        assert_eq!(kind_for(24), ExitKind::Shutdown);
        assert_eq!(kind_for(17), ExitKind::InternalError);
        assert_eq!(kind_for(9), ExitKind::InternalError);
        assert_eq!(kind_for(10), ExitKind::Interrupt);
        assert_eq!(kind_for(1234), ExitKind::Unknown(1234));
    }

    #[test]
    fn test_fault_addr() {
        assert_eq!(
            fault_addr(Arch::X86_64, ExitKind::Halt, &Payload::None, 0x10_0001),
            0x10_0000
        );
        assert_eq!(
            fault_addr(Arch::Aarch64, ExitKind::Halt, &Payload::None, 0x10_0001),
            0x10_0001
        );
        let mmio = Payload::Mmio {
            phys_addr: 0xef00_0000,
            data: [0; 8],
            len: 8,
            is_write: false,
        };
        assert_eq!(fault_addr(Arch::X86_64, ExitKind::Mmio, &mmio, 0x1000), 0xef00_0000);
        let debug = Payload::Debug {
            exception: 0,
            pc: 0,
            info: 0,
        };
        assert_eq!(fault_addr(Arch::Aarch64, ExitKind::Debug, &debug, 0xff40_0010), 0xff40_0010);
    }
}
