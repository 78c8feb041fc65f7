//! `EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL`, printing to the host.

use std::io::Write;

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::guid::SIMPLE_TEXT_OUTPUT;
use crate::uefi::table::{text_mode, text_out as op};
use crate::uefi::EfiStatus;
use crate::debug_service;

pub const NAME: &str = "SimpleTextOutput";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: Some(SIMPLE_TEXT_OUTPUT),
    aliases: &[],
    table_size: op::SIZE,
    create,
};

/// The one text mode we report.
pub const COLUMNS: u64 = 80;
pub const ROWS: u64 = 25;

/// Offset of the `SIMPLE_TEXT_OUTPUT_MODE` data inside the service base.
const MODE_OFFSET: u64 = 0x100;

/// Longest string OutputString will read, in UCS-2 units.
const MAX_STRING: usize = 0x1_0000;

fn create(_: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    let mode = base + MODE_OFFSET;
    trace.write_u32(mode + text_mode::MAX_MODE, 1)?;
    trace.write_u32(mode + text_mode::MODE, 0)?;
    trace.write_u32(mode + text_mode::ATTRIBUTE, 0x07)?;
    trace.write_u32(mode + text_mode::CURSOR_COLUMN, 0)?;
    trace.write_u32(mode + text_mode::CURSOR_ROW, 0)?;
    trace.write_u32(mode + text_mode::CURSOR_VISIBLE, 1)?;
    trace.write_word(base + op::MODE, mode)?;
    Ok(Box::new(TextOut::new(mode, Box::new(std::io::stdout()))))
}

pub struct TextOut {
    mode: u64,
    out: Box<dyn Write + Send>,
}

impl TextOut {
    pub fn new(mode: u64, out: Box<dyn Write + Send>) -> Self {
        Self { mode, out }
    }

    fn set_mode_field(&self, trace: &mut dyn Trace, field: u64, val: u64) -> Result<()> {
        trace.write_u32(self.mode + field, val as u32)
    }
}

impl Service for TextOut {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        op::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        match offset {
            op::RESET => "Reset",
            op::OUTPUT_STRING => "OutputString",
            op::TEST_STRING => "TestString",
            op::QUERY_MODE => "QueryMode",
            op::SET_MODE => "SetMode",
            op::SET_ATTRIBUTE => "SetAttribute",
            op::CLEAR_SCREEN => "ClearScreen",
            op::SET_CURSOR_POSITION => "SetCursorPosition",
            op::ENABLE_CURSOR => "EnableCursor",
            op::MODE => "Mode",
            _ => "?",
        }
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            op::RESET | op::TEST_STRING => Ok(EfiStatus::Success),
            op::OUTPUT_STRING => {
                let s = req.trace.read_ucs2(req.arg(1)?, MAX_STRING)?;
                debug_service!("OutputString {:?}", s);
                self.out.write_all(s.as_bytes())?;
                self.out.flush()?;
                Ok(EfiStatus::Success)
            }
            op::QUERY_MODE => {
                if req.arg(1)? != 0 {
                    return Ok(EfiStatus::Unsupported);
                }
                req.put_word(req.arg(2)?, COLUMNS)?;
                req.put_word(req.arg(3)?, ROWS)?;
                Ok(EfiStatus::Success)
            }
            op::SET_MODE => match req.arg(1)? {
                0 => Ok(EfiStatus::Success),
                _ => Ok(EfiStatus::Unsupported),
            },
            op::SET_ATTRIBUTE => {
                let attr = req.arg(1)?;
                self.set_mode_field(req.trace, text_mode::ATTRIBUTE, attr)?;
                Ok(EfiStatus::Success)
            }
            op::CLEAR_SCREEN => {
                self.set_mode_field(req.trace, text_mode::CURSOR_COLUMN, 0)?;
                self.set_mode_field(req.trace, text_mode::CURSOR_ROW, 0)?;
                Ok(EfiStatus::Success)
            }
            op::SET_CURSOR_POSITION => {
                let (col, row) = (req.arg(1)?, req.arg(2)?);
                if col >= COLUMNS || row >= ROWS {
                    return Ok(EfiStatus::Unsupported);
                }
                self.set_mode_field(req.trace, text_mode::CURSOR_COLUMN, col)?;
                self.set_mode_field(req.trace, text_mode::CURSOR_ROW, row)?;
                Ok(EfiStatus::Success)
            }
            op::ENABLE_CURSOR => {
                let visible = req.arg(1)? & 1;
                self.set_mode_field(req.trace, text_mode::CURSOR_VISIBLE, visible)?;
                Ok(EfiStatus::Success)
            }
            off => Err(Error::unsupported(format!("text output slot {:#x}", off))),
        }
    }

    fn load(&mut self, req: &mut Request<'_>) -> Result<u64> {
        match req.offset() {
            op::MODE => Ok(self.mode),
            _ => Ok(req.ptr.addr()),
        }
    }
}
