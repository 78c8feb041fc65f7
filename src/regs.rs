//! Canonical register snapshots.
//!
//! Each backend maps its own register layout onto [`Regs`], so the
//! dispatcher, instruction recovery and services only ever see one shape
//! per architecture. The UEFI calling convention lives here as well.

use std::fmt::Write as _;

/// Guest instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// The architecture this binary was built for.
    pub fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Aarch64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Arch::X86_64
        }
    }

    /// Number of arguments passed in registers.
    pub fn register_args(self) -> usize {
        match self {
            Arch::X86_64 => 4,
            Arch::Aarch64 => 8,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "amd64"),
            Arch::Aarch64 => write!(f, "arm64"),
        }
    }
}

/// amd64 general purpose and segment state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X64Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ds: u64,
    pub ss: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl X64Regs {
    /// Register by its instruction-encoding number (rax=0 .. r15=15).
    pub fn gpr(&self, n: u8) -> Option<u64> {
        Some(match n {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return None,
        })
    }

    pub fn gpr_mut(&mut self, n: u8) -> Option<&mut u64> {
        Some(match n {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return None,
        })
    }

    const NAMES: [&'static str; 26] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rsp", "rbp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip", "rflags", "cs", "ds", "ss", "es", "fs", "gs", "fs_base",
        "gs_base",
    ];

    fn values(&self) -> [u64; 26] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rsp, self.rbp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags, self.cs, self.ds, self.ss, self.es, self.fs, self.gs,
            self.fs_base, self.gs_base,
        ]
    }
}

/// arm64 general purpose state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arm64Regs {
    /// x0..x30
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// Link register number.
pub const ARM64_LR: u8 = 30;

/// A register snapshot for one vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regs {
    X64(X64Regs),
    Arm64(Arm64Regs),
}

impl Regs {
    /// Zeroed registers for `arch`.
    pub fn new(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Regs::X64(X64Regs::default()),
            Arch::Aarch64 => Regs::Arm64(Arm64Regs::default()),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            Regs::X64(_) => Arch::X86_64,
            Regs::Arm64(_) => Arch::Aarch64,
        }
    }

    pub fn pc(&self) -> u64 {
        match self {
            Regs::X64(r) => r.rip,
            Regs::Arm64(r) => r.pc,
        }
    }

    pub fn set_pc(&mut self, pc: u64) {
        match self {
            Regs::X64(r) => r.rip = pc,
            Regs::Arm64(r) => r.pc = pc,
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            Regs::X64(r) => r.rsp,
            Regs::Arm64(r) => r.sp,
        }
    }

    pub fn set_sp(&mut self, sp: u64) {
        match self {
            Regs::X64(r) => r.rsp = sp,
            Regs::Arm64(r) => r.sp = sp,
        }
    }

    /// The UEFI return register (`rax` / `x0`).
    pub fn ret(&self) -> u64 {
        match self {
            Regs::X64(r) => r.rax,
            Regs::Arm64(r) => r.x[0],
        }
    }

    pub fn set_ret(&mut self, val: u64) {
        match self {
            Regs::X64(r) => r.rax = val,
            Regs::Arm64(r) => r.x[0] = val,
        }
    }

    /// Return address of the current call on arm64.
    pub fn link(&self) -> Option<u64> {
        match self {
            Regs::X64(_) => None,
            Regs::Arm64(r) => Some(r.x[ARM64_LR as usize]),
        }
    }

    /// General purpose register by encoding number. On arm64 register 31
    /// reads as zero.
    pub fn gpr(&self, n: u8) -> Option<u64> {
        match self {
            Regs::X64(r) => r.gpr(n),
            Regs::Arm64(r) => match n {
                0..=30 => Some(r.x[n as usize]),
                31 => Some(0),
                _ => None,
            },
        }
    }

    /// Set a general purpose register. Writes to arm64 register 31 are
    /// discarded.
    pub fn set_gpr(&mut self, n: u8, val: u64) -> bool {
        match self {
            Regs::X64(r) => match r.gpr_mut(n) {
                Some(slot) => {
                    *slot = val;
                    true
                }
                None => false,
            },
            Regs::Arm64(r) => match n {
                0..=30 => {
                    r.x[n as usize] = val;
                    true
                }
                31 => true,
                _ => false,
            },
        }
    }

    /// Argument `n` if it is passed in a register.
    pub fn register_arg(&self, n: usize) -> Option<u64> {
        match self {
            Regs::X64(r) => match n {
                0 => Some(r.rcx),
                1 => Some(r.rdx),
                2 => Some(r.r8),
                3 => Some(r.r9),
                _ => None,
            },
            Regs::Arm64(r) => (n < 8).then(|| r.x[n]),
        }
    }

    /// Place argument `n` for a call into the guest. Only register
    /// arguments are supported.
    pub fn set_register_arg(&mut self, n: usize, val: u64) -> bool {
        match self {
            Regs::X64(r) => {
                match n {
                    0 => r.rcx = val,
                    1 => r.rdx = val,
                    2 => r.r8 = val,
                    3 => r.r9 = val,
                    _ => return false,
                }
                true
            }
            Regs::Arm64(r) if n < 8 => {
                r.x[n] = val;
                true
            }
            Regs::Arm64(_) => false,
        }
    }

    /// Comma separated register names, for the register trace.
    pub fn csv_header(arch: Arch) -> String {
        match arch {
            Arch::X86_64 => X64Regs::NAMES.join(","),
            Arch::Aarch64 => {
                let mut s = String::new();
                for i in 0..31 {
                    let _ = write!(s, "x{},", i);
                }
                s.push_str("sp,pc,pstate");
                s
            }
        }
    }

    /// One register trace row, values in hex.
    pub fn to_csv(&self) -> String {
        let vals: Vec<u64> = match self {
            Regs::X64(r) => r.values().to_vec(),
            Regs::Arm64(r) => {
                let mut v = r.x.to_vec();
                v.extend_from_slice(&[r.sp, r.pc, r.pstate]);
                v
            }
        };
        vals.iter()
            .map(|v| format!("{:#x}", v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Stack offset of the first stack-passed argument on amd64, measured from
/// `rsp` at the callee's first instruction (return address plus the
/// 32-byte shadow area).
pub const X64_STACK_ARGS_OFFSET: u64 = 0x28;
