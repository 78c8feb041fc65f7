//! arm64 vCPU setup and one-reg register access.

use std::fs::File;
use std::os::fd::AsRawFd;

use kvm_bindings::*;

use super::ioctl;
use super::vcpu::Vcpu;
use crate::error::{Error, Result};
use crate::regs::{Arm64Regs, Regs};

/// KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE
const CORE_REG_BASE: u64 = 0x6030_0000_0010_0000;

/// EL1h with D, A, I and F masked.
pub const PSTATE_EL1H_MASKED: u64 = 0x3c5;

/// Id of core register `index`, counting 64-bit words into `struct kvm_regs`.
const fn core_reg(index: u64) -> u64 {
    CORE_REG_BASE + index * 2
}

pub fn x_reg(n: u64) -> u64 {
    core_reg(n)
}

pub const SP: u64 = core_reg(31);
pub const PC: u64 = core_reg(32);
pub const PSTATE: u64 = core_reg(33);

/// Initialize the vCPU as the host's preferred target.
pub fn init_vcpu(vm: &File, vcpu: &Vcpu) -> Result<()> {
    let mut target = kvm_vcpu_init::default();
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_arm_preferred_target(vm.as_raw_fd(), &mut target)
            .map_err(|e| Error::kvm("arm_preferred_target", e))?;
    }
    let mut kvi = kvm_vcpu_init {
        target: target.target,
        ..Default::default()
    };
    kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_arm_vcpu_init(vcpu.raw_fd(), &kvi)
            .map_err(|e| Error::kvm("arm_vcpu_init", e))?;
    }
    vcpu.set_one_reg(PSTATE, PSTATE_EL1H_MASKED)
}

pub fn get_regs(vcpu: &Vcpu) -> Result<Regs> {
    let mut r = Arm64Regs::default();
    for (n, x) in r.x.iter_mut().enumerate() {
        *x = vcpu.get_one_reg(x_reg(n as u64))?;
    }
    r.sp = vcpu.get_one_reg(SP)?;
    r.pc = vcpu.get_one_reg(PC)?;
    r.pstate = vcpu.get_one_reg(PSTATE)?;
    Ok(Regs::Arm64(r))
}

pub fn set_regs(vcpu: &Vcpu, regs: &Regs) -> Result<()> {
    let Regs::Arm64(r) = regs else {
        return Err(Error::invalid("amd64 registers on an arm64 vCPU"));
    };
    for (n, x) in r.x.iter().enumerate() {
        vcpu.set_one_reg(x_reg(n as u64), *x)?;
    }
    vcpu.set_one_reg(SP, r.sp)?;
    vcpu.set_one_reg(PC, r.pc)?;
    vcpu.set_one_reg(PSTATE, r.pstate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_reg_ids() {
        assert_eq!(x_reg(0), 0x6030_0000_0010_0000);
        assert_eq!(x_reg(30), 0x6030_0000_0010_003c);
        assert_eq!(SP, 0x6030_0000_0010_003e);
        assert_eq!(PC, 0x6030_0000_0010_0040);
        assert_eq!(PSTATE, 0x6030_0000_0010_0042);
    }
}
