//! amd64 trap sites, decoded with iced-x86.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, Mnemonic, NasmFormatter, OpKind};

use super::{Op, Recovered};
use crate::error::{Error, Result};
use crate::memory::layout::SERVICE_WATERMARK;
use crate::regs::Regs;
use crate::trace::Trace;

/// Longest amd64 instruction.
pub const MAX_INSN_LEN: u64 = 16;

fn unrecoverable(pc: u64, reason: impl Into<String>) -> Error {
    Error::Unrecoverable {
        pc,
        reason: reason.into(),
    }
}

/// Up to 16 bytes at `addr`, stopping at the end of its region.
fn fetch(trace: &dyn Trace, addr: u64) -> Result<Vec<u8>> {
    let region = trace
        .memory()
        .region(addr)
        .ok_or(Error::InvalidGuestAddress(addr))?;
    let len = MAX_INSN_LEN.min(region.end() - addr);
    let mut bytes = vec![0u8; len as usize];
    trace.read(addr, &mut bytes)?;
    Ok(bytes)
}

/// Decode one 64-bit instruction at `addr`.
pub fn decode_at(trace: &dyn Trace, addr: u64) -> Result<Instruction> {
    let bytes = fetch(trace, addr)?;
    let mut decoder = Decoder::with_ip(64, &bytes, addr, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(unrecoverable(addr, format!("undecodable bytes {:02x?}", bytes)));
    }
    Ok(insn)
}

pub fn disassemble(insn: &Instruction) -> String {
    let mut formatter = NasmFormatter::new();
    let mut out = String::new();
    formatter.format(insn, &mut out);
    out
}

/// Width of the indirect call ending at `ret`, from the five bytes before it.
fn call_width(before: &[u8; 5]) -> Option<u64> {
    if before[0] == 0xff {
        Some(5)
    } else if before[2] == 0xff {
        Some(3)
    } else if before[3] == 0xff {
        Some(2)
    } else {
        None
    }
}

/// Recover the call that branched into a trap cell.
///
/// The guest is stopped on the cell's `hlt`, so the return address is on
/// top of the stack and the call instruction ends right before it.
pub fn call_site(trace: &dyn Trace, regs: &Regs) -> Result<Recovered> {
    let pc = regs.pc();
    if pc <= SERVICE_WATERMARK {
        return Err(unrecoverable(pc, "halt outside the service space"));
    }
    let ret = trace.read_word(regs.sp())?;
    let mut before = [0u8; 5];
    trace
        .read(ret.wrapping_sub(5), &mut before)
        .map_err(|_| unrecoverable(pc, format!("return address {:#x} is not mapped", ret)))?;
    let width = call_width(&before).ok_or_else(|| {
        unrecoverable(pc, format!("no indirect call before {:#x} ({:02x?})", ret, before))
    })?;
    let site = ret - width;
    let text = match decode_at(trace, site) {
        Ok(insn) => disassemble(&insn),
        Err(_) => format!("call ({} bytes)", width),
    };
    Ok(Recovered {
        op: Op::Call,
        site,
        len: width,
        text,
        returned_into_trap: true,
    })
}

/// Decode the instruction at the PC that made an MMIO access.
pub fn decode_access(trace: &dyn Trace, regs: &Regs, is_write: bool) -> Result<Recovered> {
    let pc = regs.pc();
    let insn = decode_at(trace, pc)?;
    let text = disassemble(&insn);
    let op = if insn.mnemonic() == Mnemonic::Call && insn.op0_kind() == OpKind::Memory {
        Op::Call
    } else if is_write {
        Op::Store
    } else if insn.op0_kind() == OpKind::Register && insn.op0_register().is_gpr() {
        Op::Load {
            dst: insn.op0_register().full_register().number() as u8,
        }
    } else {
        return Err(unrecoverable(pc, format!("unsupported service load `{}`", text)));
    };
    Ok(Recovered {
        op,
        site: pc,
        len: insn.len() as u64,
        text,
        returned_into_trap: false,
    })
}
