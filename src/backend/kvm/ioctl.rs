//! The KVM ioctls efivm issues.

#![allow(dead_code)]

use kvm_bindings::*;
use nix::{
    ioctl_read, ioctl_readwrite, ioctl_write_int_bad, ioctl_write_ptr, request_code_none,
};

// System
ioctl_write_int_bad!(kvm_get_api_version, request_code_none!(KVMIO, 0x00));
ioctl_write_int_bad!(kvm_create_vm, request_code_none!(KVMIO, 0x01));
ioctl_write_int_bad!(kvm_check_extension, request_code_none!(KVMIO, 0x03));
ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));
#[cfg(target_arch = "x86_64")]
ioctl_readwrite!(kvm_get_supported_cpuid, KVMIO, 0x05, kvm_cpuid2);

// VM
ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
ioctl_write_ptr!(
    kvm_set_user_memory_region,
    KVMIO,
    0x46,
    kvm_userspace_memory_region
);
#[cfg(target_arch = "x86_64")]
ioctl_write_int_bad!(kvm_set_tss_addr, request_code_none!(KVMIO, 0x47));
#[cfg(target_arch = "aarch64")]
ioctl_read!(kvm_arm_preferred_target, KVMIO, 0xaf, kvm_vcpu_init);

// vCPU
ioctl_write_int_bad!(kvm_run, request_code_none!(KVMIO, 0x80));
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_regs, KVMIO, 0x81, kvm_regs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, kvm_regs);
#[cfg(target_arch = "x86_64")]
ioctl_read!(kvm_get_sregs, KVMIO, 0x83, kvm_sregs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, kvm_sregs);
#[cfg(target_arch = "x86_64")]
ioctl_write_ptr!(kvm_set_cpuid2, KVMIO, 0x90, kvm_cpuid2);
ioctl_write_ptr!(kvm_set_guest_debug, KVMIO, 0x9b, kvm_guest_debug);
ioctl_write_ptr!(kvm_get_one_reg, KVMIO, 0xab, kvm_one_reg);
ioctl_write_ptr!(kvm_set_one_reg, KVMIO, 0xac, kvm_one_reg);
#[cfg(target_arch = "aarch64")]
ioctl_write_ptr!(kvm_arm_vcpu_init, KVMIO, 0xae, kvm_vcpu_init);
