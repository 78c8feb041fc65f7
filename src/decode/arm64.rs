//! arm64 trap sites.
//!
//! Only the handful of encodings a UEFI application uses to reach a
//! service are recognized: `blr` for calls and unsigned-offset `ldr`/`str`
//! for slot accesses.

use super::{Op, Recovered};
use crate::error::{Error, Result};
use crate::regs::Regs;
use crate::trace::Trace;

const BLR_MASK: u32 = 0xffff_fc1f;
const BLR: u32 = 0xd63f_0000;

const LDST_MASK: u32 = 0xffc0_0000;
const LDR_X: u32 = 0xf940_0000;
const LDR_W: u32 = 0xb940_0000;
const STR_X: u32 = 0xf900_0000;
const STR_W: u32 = 0xb900_0000;

/// One decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Blr { rn: u8 },
    Ldr { rt: u8, rn: u8, imm: u32, wide: bool },
    Str { rt: u8, rn: u8, imm: u32, wide: bool },
    Other(u32),
}

pub fn decode(word: u32) -> Insn {
    let rt = (word & 0x1f) as u8;
    let rn = ((word >> 5) & 0x1f) as u8;
    let imm12 = (word >> 10) & 0xfff;
    if word & BLR_MASK == BLR {
        return Insn::Blr { rn };
    }
    match word & LDST_MASK {
        LDR_X => Insn::Ldr { rt, rn, imm: imm12 * 8, wide: true },
        LDR_W => Insn::Ldr { rt, rn, imm: imm12 * 4, wide: false },
        STR_X => Insn::Str { rt, rn, imm: imm12 * 8, wide: true },
        STR_W => Insn::Str { rt, rn, imm: imm12 * 4, wide: false },
        _ => Insn::Other(word),
    }
}

fn reg(n: u8, wide: bool) -> String {
    match (n, wide) {
        (31, true) => "xzr".into(),
        (31, false) => "wzr".into(),
        (n, true) => format!("x{}", n),
        (n, false) => format!("w{}", n),
    }
}

fn base(n: u8) -> String {
    if n == 31 {
        "sp".into()
    } else {
        format!("x{}", n)
    }
}

impl std::fmt::Display for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Insn::Blr { rn } => write!(f, "blr x{}", rn),
            Insn::Ldr { rt, rn, imm, wide } => {
                write!(f, "ldr {}, [{}, #{:#x}]", reg(rt, wide), base(rn), imm)
            }
            Insn::Str { rt, rn, imm, wide } => {
                write!(f, "str {}, [{}, #{:#x}]", reg(rt, wide), base(rn), imm)
            }
            Insn::Other(w) => write!(f, ".inst {:#010x}", w),
        }
    }
}

fn read_insn(trace: &dyn Trace, addr: u64) -> Result<Insn> {
    Ok(decode(trace.read_u32(addr)?))
}

/// Recover the `blr` that branched into a trap cell: it sits right before
/// the link register.
pub fn call_site(trace: &dyn Trace, regs: &Regs) -> Result<Recovered> {
    let pc = regs.pc();
    let lr = regs.link().unwrap_or(0);
    let site = lr.wrapping_sub(4);
    let insn = read_insn(trace, site).map_err(|_| Error::Unrecoverable {
        pc,
        reason: format!("link register {:#x} is not mapped", lr),
    })?;
    match insn {
        Insn::Blr { .. } => Ok(Recovered {
            op: Op::Call,
            site,
            len: 4,
            text: insn.to_string(),
            returned_into_trap: true,
        }),
        other => Err(Error::Unrecoverable {
            pc,
            reason: format!("no blr before {:#x} (`{}`)", lr, other),
        }),
    }
}

/// Decode the instruction at the PC that made an MMIO access.
pub fn decode_access(trace: &dyn Trace, regs: &Regs, is_write: bool) -> Result<Recovered> {
    let pc = regs.pc();
    let insn = read_insn(trace, pc)?;
    let op = match insn {
        Insn::Ldr { rt, .. } if !is_write => Op::Load { dst: rt },
        Insn::Str { .. } if is_write => Op::Store,
        Insn::Other(_) if is_write => Op::Store,
        other => {
            return Err(Error::Unrecoverable {
                pc,
                reason: format!("unsupported service access `{}`", other),
            })
        }
    };
    Ok(Recovered {
        op,
        site: pc,
        len: 4,
        text: insn.to_string(),
        returned_into_trap: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Arch;
    use crate::trace::testing::FakeTrace;

    #[test]
    fn test_decode_words() {
        assert_eq!(decode(0xd63f_0100), Insn::Blr { rn: 8 });
        // ldr x1, [x0, #0x60]
        assert_eq!(
            decode(0xf940_3001),
            Insn::Ldr { rt: 1, rn: 0, imm: 0x60, wide: true }
        );
        // str w2, [x3]
        assert_eq!(
            decode(0xb900_0062),
            Insn::Str { rt: 2, rn: 3, imm: 0, wide: false }
        );
        assert_eq!(decode(0xd503_201f), Insn::Other(0xd503_201f));
        assert_eq!(decode(0xf940_3001).to_string(), "ldr x1, [x0, #0x60]");
    }

    #[test]
    fn test_call_site_before_link_register() {
        let mut t = FakeTrace::new(Arch::Aarch64);
        t.write_u32(0x1000, 0xd63f_0100).unwrap();
        let mut regs = t.get_regs().unwrap();
        regs.set_gpr(30, 0x1004);
        regs.set_pc(0xff41_0098);

        let r = call_site(&t, &regs).unwrap();
        assert_eq!((r.op, r.site, r.len), (Op::Call, 0x1000, 4));
        assert_eq!(r.text, "blr x8");

        regs.set_gpr(30, 0x1008);
        assert!(call_site(&t, &regs).is_err());
    }

    #[test]
    fn test_access_kinds() {
        let mut t = FakeTrace::new(Arch::Aarch64);
        t.write_u32(0x2000, 0xf940_3001).unwrap();
        t.write_u32(0x2004, 0xb900_0062).unwrap();
        let mut regs = t.get_regs().unwrap();

        regs.set_pc(0x2000);
        assert_eq!(decode_access(&t, &regs, false).unwrap().op, Op::Load { dst: 1 });
        assert!(decode_access(&t, &regs, true).is_err());

        regs.set_pc(0x2004);
        assert_eq!(decode_access(&t, &regs, true).unwrap().op, Op::Store);
    }
}
