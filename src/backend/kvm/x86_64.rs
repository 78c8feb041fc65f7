//! amd64 vCPU setup: identity page tables, long mode, CPUID and the
//! mapping between `kvm_regs` and [`X64Regs`].

use std::fs::File;
use std::os::fd::AsRawFd;

use kvm_bindings::*;

use super::ioctl;
use super::vcpu::Vcpu;
use crate::debug_kvm;
use crate::error::{Error, Result};
use crate::memory::layout::PAGE_TABLE_BASE;
use crate::memory::GuestMemory;
use crate::regs::{Regs, X64Regs};

/// Guest address of the TSS KVM needs on Intel hosts.
pub const TSS_ADDR: i32 = 0xfffb_d000_u32 as i32;

const PML4: u64 = PAGE_TABLE_BASE;
const PDPT: u64 = PAGE_TABLE_BASE + 0x1000;
const PD: u64 = PAGE_TABLE_BASE + 0x2000;

/// PDPTs needed to cover the low 4 GiB.
const PD_COUNT: u64 = 4;

const PTE_PRESENT_RW: u64 = 0x3;
const PTE_USER: u64 = 0x4;
const PTE_ACCESSED_DIRTY: u64 = 0x60;
const PTE_LARGE: u64 = 0x80;

const CR0_LONG_MODE: u64 = 0x8005_0033;
const CR4_PAE: u64 = 0x20;
const EFER_LME_LMA: u64 = 0x500;

const MAX_CPUID_ENTRIES: usize = 256;

/// Write a 4-level identity map of the low 4 GiB built from 2 MiB pages.
pub fn write_page_tables(mem: &mut GuestMemory) -> Result<()> {
    mem.write_word(PML4, PDPT | PTE_PRESENT_RW)?;
    for i in 0..PD_COUNT {
        let pd = PD + i * 0x1000;
        mem.write_word(PDPT + i * 8, pd | PTE_PRESENT_RW | PTE_ACCESSED_DIRTY)?;
        for j in 0..512 {
            let page = (i * 512 + j) << 21;
            // Large-page leaf: present, writable, user, accessed, dirty.
            let flags = PTE_PRESENT_RW | PTE_USER | PTE_ACCESSED_DIRTY | PTE_LARGE;
            mem.write_word(pd + j * 8, page | flags)?;
        }
    }
    Ok(())
}

pub fn set_tss_addr(vm: &File) -> Result<()> {
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_set_tss_addr(vm.as_raw_fd(), TSS_ADDR)
            .map_err(|e| Error::kvm("set_tss_addr", e))?;
    }
    Ok(())
}

/// Flat 64-bit code and data segments, paging on. The kernel's segment
/// state is read and modified, not rebuilt.
pub fn enter_long_mode(vcpu: &Vcpu) -> Result<()> {
    let mut sregs = get_sregs(vcpu)?;
    sregs.cs = kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: 8,
        type_: 11,
        present: 1,
        s: 1,
        l: 1,
        g: 1,
        ..sregs.cs
    };
    let data = kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: 16,
        type_: 3,
        present: 1,
        s: 1,
        db: 1,
        g: 1,
        ..sregs.ds
    };
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.cr0 = CR0_LONG_MODE;
    sregs.cr3 = PML4;
    sregs.cr4 |= CR4_PAE;
    sregs.efer |= EFER_LME_LMA;

    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_set_sregs(vcpu.raw_fd(), &sregs).map_err(|e| Error::kvm("set_sregs", e))?;
    }
    debug_kvm!("long mode: cr0 {:#x} cr3 {:#x} efer {:#x}", sregs.cr0, sregs.cr3, sregs.efer);
    Ok(())
}

#[repr(C)]
struct Cpuid {
    cpuid: kvm_cpuid2,
    entries: [kvm_cpuid_entry2; MAX_CPUID_ENTRIES],
}

/// Give the vCPU everything the host supports.
pub fn set_supported_cpuid(kvm: &File, vcpu: &Vcpu) -> Result<()> {
    let mut cpuid = Cpuid {
        cpuid: kvm_cpuid2 {
            nent: MAX_CPUID_ENTRIES as u32,
            ..Default::default()
        },
        entries: [Default::default(); MAX_CPUID_ENTRIES],
    };
    // SAFETY: entries has room for nent entries, and the same buffer is
    // passed back with the count the kernel filled in.
    unsafe {
        ioctl::kvm_get_supported_cpuid(kvm.as_raw_fd(), &mut cpuid.cpuid)
            .map_err(|e| Error::kvm("get_supported_cpuid", e))?;
        ioctl::kvm_set_cpuid2(vcpu.raw_fd(), &cpuid.cpuid)
            .map_err(|e| Error::kvm("set_cpuid2", e))?;
    }
    debug_kvm!("{} cpuid entries", cpuid.cpuid.nent);
    Ok(())
}

fn get_sregs(vcpu: &Vcpu) -> Result<kvm_sregs> {
    let mut sregs = kvm_sregs::default();
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_get_sregs(vcpu.raw_fd(), &mut sregs).map_err(|e| Error::kvm("get_sregs", e))?;
    }
    Ok(sregs)
}

pub fn get_regs(vcpu: &Vcpu) -> Result<Regs> {
    let mut regs = kvm_regs::default();
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_get_regs(vcpu.raw_fd(), &mut regs).map_err(|e| Error::kvm("get_regs", e))?;
    }
    let sregs = get_sregs(vcpu)?;
    Ok(Regs::X64(from_kvm(&regs, &sregs)))
}

/// Write the general purpose registers. Segment state is left alone.
pub fn set_regs(vcpu: &Vcpu, regs: &Regs) -> Result<()> {
    let Regs::X64(r) = regs else {
        return Err(Error::invalid("arm64 registers on an amd64 vCPU"));
    };
    let kregs = to_kvm(r);
    // SAFETY: Calling IOCTL as documented, with no special requirements.
    unsafe {
        ioctl::kvm_set_regs(vcpu.raw_fd(), &kregs).map_err(|e| Error::kvm("set_regs", e))?;
    }
    Ok(())
}

fn from_kvm(r: &kvm_regs, s: &kvm_sregs) -> X64Regs {
    X64Regs {
        rax: r.rax,
        rbx: r.rbx,
        rcx: r.rcx,
        rdx: r.rdx,
        rsi: r.rsi,
        rdi: r.rdi,
        rsp: r.rsp,
        rbp: r.rbp,
        r8: r.r8,
        r9: r.r9,
        r10: r.r10,
        r11: r.r11,
        r12: r.r12,
        r13: r.r13,
        r14: r.r14,
        r15: r.r15,
        rip: r.rip,
        rflags: r.rflags,
        cs: u64::from(s.cs.selector),
        ds: u64::from(s.ds.selector),
        ss: u64::from(s.ss.selector),
        es: u64::from(s.es.selector),
        fs: u64::from(s.fs.selector),
        gs: u64::from(s.gs.selector),
        fs_base: s.fs.base,
        gs_base: s.gs.base,
    }
}

fn to_kvm(r: &X64Regs) -> kvm_regs {
    kvm_regs {
        rax: r.rax,
        rbx: r.rbx,
        rcx: r.rcx,
        rdx: r.rdx,
        rsi: r.rsi,
        rdi: r.rdi,
        rsp: r.rsp,
        rbp: r.rbp,
        r8: r.r8,
        r9: r.r9,
        r10: r.r10,
        r11: r.r11,
        r12: r.r12,
        r13: r.r13,
        r14: r.r14,
        r15: r.r15,
        rip: r.rip,
        rflags: r.rflags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{PAGE_TABLE_SIZE, SLOT_PAGE_TABLES};

    #[test]
    fn test_page_tables_identity_map_4g() {
        let mut mem = GuestMemory::new();
        mem.add_region(SLOT_PAGE_TABLES, PAGE_TABLE_BASE, PAGE_TABLE_SIZE)
            .unwrap();
        write_page_tables(&mut mem).unwrap();

        assert_eq!(mem.read_word(PML4).unwrap(), 0xffff_1003);
        assert_eq!(mem.read_word(PDPT).unwrap(), 0xffff_2063);
        assert_eq!(mem.read_word(PDPT + 24).unwrap(), 0xffff_5063);
        assert_eq!(mem.read_word(PD).unwrap(), 0xe7);
        assert_eq!(mem.read_word(PD + 8).unwrap(), 0x20_00e7);
        // Last 2 MiB page, holding the service space and these tables.
        assert_eq!(mem.read_word(PD + 3 * 0x1000 + 511 * 8).unwrap(), 0xffe0_00e7);
    }

    #[test]
    fn test_regs_mapping() {
        let kregs = kvm_regs {
            rcx: 1,
            rdx: 2,
            rsp: 0x1f_ffe0,
            rip: 0x10_1000,
            rflags: 2,
            ..Default::default()
        };
        let mut sregs = kvm_sregs::default();
        sregs.cs.selector = 8;
        sregs.fs.base = 0x1234;
        let r = from_kvm(&kregs, &sregs);
        assert_eq!((r.rcx, r.rdx, r.cs, r.fs_base), (1, 2, 8, 0x1234));
        let back = to_kvm(&r);
        assert_eq!((back.rsp, back.rip, back.rflags), (0x1f_ffe0, 0x10_1000, 2));
    }
}
