//! The single KVM vCPU and its shared `kvm_run` page.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};

use kvm_bindings::*;

use super::ioctl;
use crate::debug_kvm;
use crate::error::{Error, Result};

/// The mapped `kvm_run` area.
#[derive(Debug)]
struct RunPtr {
    ptr: *mut kvm_run,
    len: usize,
}

impl Drop for RunPtr {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the mapping made in `Vcpu::new`.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// How a `KVM_RUN` came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The guest exited; `exit_reason` is valid.
    Exited,
    /// A host signal cut the run short.
    Interrupted,
}

/// A vCPU file descriptor plus its run page.
#[derive(Debug)]
pub struct Vcpu {
    fd: File,
    run: RunPtr,
}

// SAFETY: the run page is only touched by the thread that owns the Vcpu, and
// never while KVM_RUN is in progress.
unsafe impl Send for Vcpu {}

impl Vcpu {
    /// Create vCPU `id` on `vm` and map its `mmap_size`-byte run area.
    pub fn new(vm: &File, id: u32, mmap_size: usize) -> Result<Self> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let fd = unsafe {
            let fd = ioctl::kvm_create_vcpu(vm.as_raw_fd(), id as i32)
                .map_err(|e| Error::kvm("create_vcpu", e))?;
            File::from_raw_fd(fd)
        };

        // SAFETY: Calling mmap with a null pointer is valid, and fd is a valid vCPU.
        let ptr = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::VcpuError(format!(
                    "mmap of kvm_run failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            ptr
        };

        debug_kvm!("vcpu {} created, kvm_run is {:#x} bytes", id, mmap_size);
        Ok(Self {
            fd,
            run: RunPtr {
                ptr: ptr.cast(),
                len: mmap_size,
            },
        })
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub fn run_data(&self) -> &kvm_run {
        // SAFETY: the vCPU is not running, so the kernel is not writing the page.
        unsafe { &*self.run.ptr }
    }

    pub fn run_data_mut(&mut self) -> &mut kvm_run {
        // SAFETY: as above, and &mut self makes this the only reference.
        unsafe { &mut *self.run.ptr }
    }

    /// Run until the next exit.
    pub fn run(&mut self) -> Result<RunResult> {
        self.run_data_mut().immediate_exit = 0;
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let result = unsafe { ioctl::kvm_run(self.fd.as_raw_fd(), 0) };
        match result {
            Ok(_) => Ok(RunResult::Exited),
            Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => Ok(RunResult::Interrupted),
            Err(e) => Err(Error::kvm("run", e)),
        }
    }

    /// Program `KVM_SET_GUEST_DEBUG` with `control` flags.
    pub fn set_guest_debug(&self, control: u32) -> Result<()> {
        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_guest_debug(self.fd.as_raw_fd(), &debug)
                .map_err(|e| Error::kvm("set_guest_debug", e))?;
        }
        Ok(())
    }

    pub fn get_one_reg(&self, id: u64) -> Result<u64> {
        let mut value: u64 = 0;
        let reg = kvm_one_reg {
            id,
            addr: std::ptr::from_mut(&mut value) as u64,
        };
        // SAFETY: reg.addr points at a u64 that outlives the call.
        unsafe {
            ioctl::kvm_get_one_reg(self.fd.as_raw_fd(), &reg)
                .map_err(|e| Error::kvm("get_one_reg", e))?;
        }
        Ok(value)
    }

    pub fn set_one_reg(&self, id: u64, value: u64) -> Result<()> {
        let reg = kvm_one_reg {
            id,
            addr: std::ptr::from_ref(&value) as u64,
        };
        // SAFETY: reg.addr points at a u64 that outlives the call.
        unsafe {
            ioctl::kvm_set_one_reg(self.fd.as_raw_fd(), &reg)
                .map_err(|e| Error::kvm("set_one_reg", e))?;
        }
        Ok(())
    }

    /// Hand the result of an MMIO read back to KVM, which finishes the
    /// access on the next run.
    pub fn complete_mmio_read(&mut self, value: u64) {
        let run = self.run_data_mut();
        // SAFETY: the last exit was KVM_EXIT_MMIO, so mmio is the live member.
        let mmio = unsafe { &mut run.__bindgen_anon_1.mmio };
        let len = (mmio.len as usize).min(8);
        mmio.data[..len].copy_from_slice(&value.to_le_bytes()[..len]);
    }
}
