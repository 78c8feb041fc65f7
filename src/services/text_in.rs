//! `EFI_SIMPLE_TEXT_INPUT_PROTOCOL`, fed from host stdin.

use std::io::Read;

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::guid::{SIMPLE_TEXT_INPUT, SIMPLE_TEXT_INPUT_EX};
use crate::uefi::table::text_in as op;
use crate::uefi::EfiStatus;
use crate::debug_service;

pub const NAME: &str = "SimpleTextInput";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: Some(SIMPLE_TEXT_INPUT),
    aliases: &[SIMPLE_TEXT_INPUT_EX],
    table_size: op::SIZE,
    create,
};

fn create(d: &mut Dispatcher, _: &mut dyn Trace, _: u64) -> Result<Box<dyn Service>> {
    let input: Option<Box<dyn Read + Send>> = if d.options().handle_console_io {
        Some(Box::new(std::io::stdin()))
    } else {
        None
    };
    Ok(Box::new(TextIn::new(input)))
}

/// Reads keys from `input`, or reports none when there is no input.
pub struct TextIn {
    input: Option<Box<dyn Read + Send>>,
}

impl TextIn {
    pub fn new(input: Option<Box<dyn Read + Send>>) -> Self {
        Self { input }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let input = self.input.as_mut()?;
        let mut b = [0u8; 1];
        match input.read(&mut b) {
            Ok(1) => Some(b[0]),
            Ok(_) => None,
            Err(e) => {
                log::warn!("console input: {}", e);
                None
            }
        }
    }
}

impl Service for TextIn {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        op::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        match offset {
            op::RESET => "Reset",
            op::READ_KEY_STROKE => "ReadKeyStroke",
            op::WAIT_FOR_KEY => "WaitForKey",
            _ => "?",
        }
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            op::RESET | op::WAIT_FOR_KEY => Ok(EfiStatus::Success),
            op::READ_KEY_STROKE => {
                let key = req.arg(1)?;
                if key == 0 {
                    return Err(Error::invalid("null EFI_INPUT_KEY"));
                }
                let Some(b) = self.next_byte() else {
                    return Ok(EfiStatus::NotReady);
                };
                // Enter is a carriage return in UEFI.
                let ch = if b == b'\n' { u16::from(b'\r') } else { u16::from(b) };
                debug_service!("ReadKeyStroke {:#x}", ch);
                let mut buf = [0u8; 4];
                buf[2..].copy_from_slice(&ch.to_le_bytes());
                req.trace.write(key, &buf)?;
                Ok(EfiStatus::Success)
            }
            off => Err(Error::unsupported(format!("text input slot {:#x}", off))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::regs::Arch;
    use crate::services::testing::{self, call};

    const BASE: u64 = 0xff3d_0000;

    #[test]
    fn test_read_key_stroke_from_input() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let input = Box::new(Cursor::new(b"a\n".to_vec()));
        d.register_at(BASE, Box::new(TextIn::new(Some(input)))).unwrap();

        call(&mut t, &mut d, BASE, op::READ_KEY_STROKE, &[BASE, 0x2000]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_u32(0x2000).unwrap(), u32::from(b'a') << 16);

        call(&mut t, &mut d, BASE, op::READ_KEY_STROKE, &[BASE, 0x2000]);
        assert_eq!(t.read_u32(0x2000).unwrap() >> 16, 0x0d);

        call(&mut t, &mut d, BASE, op::READ_KEY_STROKE, &[BASE, 0x2000]);
        assert_eq!(t.regs.ret(), EfiStatus::NotReady.to_guest());
    }

    #[test]
    fn test_without_console_io() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let base = d.instantiate(&mut t, NAME).unwrap();
        call(&mut t, &mut d, base, op::READ_KEY_STROKE, &[base, 0x2000]);
        assert_eq!(t.regs.ret(), EfiStatus::NotReady.to_guest());

        call(&mut t, &mut d, base, op::READ_KEY_STROKE, &[base, 0]);
        assert_eq!(t.regs.ret(), EfiStatus::InvalidParameter.to_guest());
    }
}
