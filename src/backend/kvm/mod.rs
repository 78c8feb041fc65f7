//! Linux KVM backend.
//!
//! One VM with one vCPU, driven through raw KVM ioctls. [`KvmTrace`] owns
//! the `/dev/kvm` handle, the VM, the vCPU and the guest memory bound to
//! it, and implements [`Trace`] on top of them.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support (API version 12)
//! - Read/write access to the KVM device, `/dev/kvm` by default
//! - amd64 or arm64 host

#[cfg(target_arch = "aarch64")]
mod aarch64;
pub mod exit;
mod ioctl;
mod vcpu;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::Path;

use kvm_bindings::*;

use self::vcpu::{RunResult, Vcpu};
use crate::backend::VmConfig;
use crate::debug_kvm;
use crate::error::{Error, Result};
use crate::fault::{ExitKind, Fault, Payload};
use crate::memory::layout::{
    PAGE_TABLE_BASE, PAGE_TABLE_SIZE, SERVICE_TABLE_BASE, SERVICE_TABLE_SIZE, SERVICE_TRAP_BASE,
    SERVICE_TRAP_SIZE, SLOT_LOW_RAM, SLOT_PAGE_TABLES, SLOT_SERVICE_TABLES, SLOT_SERVICE_TRAPS,
};
use crate::memory::{GuestMemory, GuestRegion};
use crate::regs::{Arch, Regs};
use crate::trace::Trace;

/// The only KVM API version there has ever been.
pub const KVM_API_VERSION: i32 = 12;

const GUESTDBG_ENABLE: u32 = 0x1;
const GUESTDBG_SINGLESTEP: u32 = 0x2;
#[cfg(target_arch = "aarch64")]
const GUESTDBG_USE_SW_BP: u32 = 0x1_0000;

/// Check if the default KVM device exists.
pub fn is_available() -> bool {
    Path::new(crate::backend::DEFAULT_DEVICE).exists()
}

/// An open KVM device.
#[derive(Debug)]
pub struct Kvm(File);

impl Kvm {
    /// Open `path` and insist on API version 12.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::OpenDevice {
                path: path.to_path_buf(),
                source,
            })?;
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let version = unsafe {
            ioctl::kvm_get_api_version(file.as_raw_fd(), 0)
                .map_err(|e| Error::kvm("get_api_version", e))?
        };
        if version != KVM_API_VERSION {
            return Err(Error::ApiVersion(version));
        }
        Ok(Self(file))
    }

    pub fn check_extension(&self, extension: u32) -> bool {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe { ioctl::kvm_check_extension(self.0.as_raw_fd(), extension as i32) }
            .map(|r| r > 0)
            .unwrap_or(false)
    }

    pub fn create_vm(&self) -> Result<Vm> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let vm = unsafe {
            let fd = ioctl::kvm_create_vm(self.0.as_raw_fd(), 0)
                .map_err(|e| Error::kvm("create_vm", e))?;
            File::from_raw_fd(fd)
        };
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let mmap_size = unsafe {
            ioctl::kvm_get_vcpu_mmap_size(self.0.as_raw_fd(), 0)
                .map_err(|e| Error::kvm("get_vcpu_mmap_size", e))? as usize
        };
        Ok(Vm {
            file: vm,
            mmap_size,
            readonly_mem: self.check_extension(KVM_CAP_READONLY_MEM),
        })
    }
}

/// A KVM VM.
#[derive(Debug)]
pub struct Vm {
    file: File,
    mmap_size: usize,
    readonly_mem: bool,
}

impl Vm {
    /// Bind `region` as a memory slot. `readonly` is honored when the host
    /// supports read-only slots.
    pub fn map_region(&self, region: &GuestRegion, readonly: bool) -> Result<()> {
        let flags = if readonly && self.readonly_mem {
            KVM_MEM_READONLY
        } else {
            0
        };
        let mem = kvm_userspace_memory_region {
            slot: region.slot,
            flags,
            guest_phys_addr: region.guest_addr,
            memory_size: region.size,
            userspace_addr: region.host_addr(),
        };
        // SAFETY: the region's host mapping lives as long as the GuestMemory
        // that owns it, which is dropped after the VM.
        unsafe {
            ioctl::kvm_set_user_memory_region(self.file.as_raw_fd(), &mem)
                .map_err(|e| Error::kvm("set_user_memory_region", e))?;
        }
        debug_kvm!(
            "slot {}: {:#x}+{:#x} -> host {:#x}{}",
            region.slot,
            region.guest_addr,
            region.size,
            region.host_addr(),
            if flags != 0 { " (ro)" } else { "" }
        );
        Ok(())
    }

    pub fn create_vcpu(&self, id: u32) -> Result<Vcpu> {
        Vcpu::new(&self.file, id, self.mmap_size)
    }
}

/// A KVM guest seen as a [`Trace`].
pub struct KvmTrace {
    // Field order is drop order: the vCPU and VM go before the memory
    // they map.
    vcpu: Vcpu,
    #[allow(dead_code)]
    vm: Vm,
    #[allow(dead_code)]
    kvm: Kvm,
    memory: GuestMemory,
    arch: Arch,
    stepping: bool,
    pending_read: bool,
}

impl KvmTrace {
    /// Build a VM with the standard memory layout and a vCPU ready to run
    /// 64-bit code.
    pub fn new(config: &VmConfig) -> Result<Self> {
        config.validate()?;
        let kvm = Kvm::open(&config.device)?;
        let vm = kvm.create_vm()?;
        #[cfg(target_arch = "x86_64")]
        x86_64::set_tss_addr(&vm.file)?;

        let mut memory = GuestMemory::new();
        for (slot, addr, size, readonly) in [
            (SLOT_LOW_RAM, 0, config.low_ram_size, false),
            (SLOT_PAGE_TABLES, PAGE_TABLE_BASE, PAGE_TABLE_SIZE, false),
            (SLOT_SERVICE_TABLES, SERVICE_TABLE_BASE, SERVICE_TABLE_SIZE, false),
            (SLOT_SERVICE_TRAPS, SERVICE_TRAP_BASE, SERVICE_TRAP_SIZE, true),
        ] {
            let region = memory.add_region(slot, addr, size)?;
            vm.map_region(region, readonly)?;
        }

        let vcpu = vm.create_vcpu(0)?;
        let arch = Arch::host();

        #[cfg(target_arch = "x86_64")]
        {
            x86_64::write_page_tables(&mut memory)?;
            x86_64::set_supported_cpuid(&kvm.0, &vcpu)?;
            x86_64::enter_long_mode(&vcpu)?;
        }
        #[cfg(target_arch = "aarch64")]
        aarch64::init_vcpu(&vm.file, &vcpu)?;

        let mut trace = Self {
            vcpu,
            vm,
            kvm,
            memory,
            arch,
            stepping: false,
            pending_read: false,
        };
        trace.program_debug()?;
        log::info!(
            "KVM VM created: {} with {:#x} bytes of low RAM",
            arch,
            config.low_ram_size
        );
        Ok(trace)
    }

    /// arm64 traps come from `brk`, so software breakpoints are always on.
    fn program_debug(&mut self) -> Result<()> {
        #[allow(unused_mut)]
        let mut control = if self.stepping {
            GUESTDBG_ENABLE | GUESTDBG_SINGLESTEP
        } else {
            0
        };
        #[cfg(target_arch = "aarch64")]
        {
            control |= GUESTDBG_ENABLE | GUESTDBG_USE_SW_BP;
        }
        self.vcpu.set_guest_debug(control)
    }

    fn regs(&mut self) -> Result<Regs> {
        #[cfg(target_arch = "x86_64")]
        {
            x86_64::get_regs(&self.vcpu)
        }
        #[cfg(target_arch = "aarch64")]
        {
            aarch64::get_regs(&self.vcpu)
        }
    }
}

impl Trace for KvmTrace {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn enter(&mut self) -> Result<Fault> {
        self.pending_read = false;
        let result = self.vcpu.run()?;
        let regs = self.regs()?;
        if result == RunResult::Interrupted {
            let pc = regs.pc();
            return Ok(Fault::new(ExitKind::Interrupt, pc, Payload::None, regs));
        }

        let run = self.vcpu.run_data();
        let kind = exit::kind_for(run.exit_reason);
        // SAFETY: KVM_RUN just returned successfully.
        let payload = unsafe { exit::payload(run) };
        let addr = exit::fault_addr(self.arch, kind, &payload, regs.pc());
        if let Payload::Mmio { is_write: false, .. } = payload {
            self.pending_read = true;
        }
        if let ExitKind::Unknown(reason) = kind {
            log::warn!("unhandled KVM exit reason {} at pc {:#x}", reason, regs.pc());
        }
        debug_kvm!("exit {} at {:#x} (pc {:#x})", kind, addr, regs.pc());
        Ok(Fault::new(kind, addr, payload, regs))
    }

    fn single_step(&mut self, on: bool) -> Result<()> {
        self.stepping = on;
        self.program_debug()
    }

    fn get_regs(&mut self) -> Result<Regs> {
        self.regs()
    }

    fn set_regs(&mut self, regs: &Regs) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        {
            x86_64::set_regs(&self.vcpu, regs)
        }
        #[cfg(target_arch = "aarch64")]
        {
            aarch64::set_regs(&self.vcpu, regs)
        }
    }

    fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    /// KVM replays the faulting access on the next run, so `len` is not
    /// needed to step past it.
    fn complete_mmio(&mut self, reply: Option<u64>, _len: u64) -> Result<()> {
        if let (true, Some(value)) = (self.pending_read, reply) {
            self.vcpu.complete_mmio_read(value);
        }
        self.pending_read = false;
        Ok(())
    }
}
