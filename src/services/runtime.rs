//! `EFI_RUNTIME_SERVICES`: time, variables and reset.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::table::{runtime as op, HEADER_SIZE};
use crate::uefi::variables::{MAX_STORAGE, MAX_VARIABLE_SIZE};
use crate::uefi::{EfiStatus, EfiTime, VariableStore};
use crate::debug_service;

use super::system_table::{seal_table, write_header};

pub const NAME: &str = "RuntimeServices";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: None,
    aliases: &[],
    table_size: op::SIZE,
    create,
};

/// Longest variable name, in UCS-2 units.
const MAX_NAME: usize = 512;

fn create(_: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    write_header(trace, base, op::SIGNATURE, op::SIZE)?;
    seal_table(trace, base, op::SIZE)?;
    Ok(Box::new(RuntimeServices::default()))
}

#[derive(Default)]
pub struct RuntimeServices {
    variables: VariableStore,
    high_count: u32,
}

impl RuntimeServices {
    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    fn get_time(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let time = req.arg(0)?;
        if time == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::invalid(format!("host clock: {}", e)))?;
        let t = EfiTime::from_unix(now.as_secs(), now.subsec_nanos());
        req.trace.memory_mut().write_obj(time, &t)?;

        let caps = req.arg(1)?;
        if caps != 0 {
            // Resolution 1 Hz, accuracy 50 ppm in units of 1e-6 ppm, SetsToZero false.
            let mut b = [0u8; 9];
            b[0..4].copy_from_slice(&1u32.to_le_bytes());
            b[4..8].copy_from_slice(&50_000_000u32.to_le_bytes());
            req.trace.write(caps, &b)?;
        }
        Ok(EfiStatus::Success)
    }

    fn get_variable(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let name = req.trace.read_ucs2(req.arg(0)?, MAX_NAME)?;
        let guid = req.trace.read_guid(req.arg(1)?)?;
        let (attrs_ptr, size_ptr, data) = (req.arg(2)?, req.arg(3)?, req.arg(4)?);
        if size_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let Some(var) = self.variables.get(&name, &guid) else {
            debug_service!("GetVariable {}:{} not found", name, guid);
            return Ok(EfiStatus::NotFound);
        };
        let len = var.data.len() as u64;
        let room = req.trace.read_word(size_ptr)?;
        req.put_word(size_ptr, len)?;
        if room < len {
            return Ok(EfiStatus::BufferTooSmall);
        }
        if data == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        req.trace.write(data, &var.data)?;
        if attrs_ptr != 0 {
            req.trace.write_u32(attrs_ptr, var.attributes)?;
        }
        Ok(EfiStatus::Success)
    }

    fn get_next_variable_name(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (size_ptr, name_ptr, guid_ptr) = (req.arg(0)?, req.arg(1)?, req.arg(2)?);
        if size_ptr == 0 || name_ptr == 0 || guid_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let name = req.trace.read_ucs2(name_ptr, MAX_NAME)?;
        let guid = req.trace.read_guid(guid_ptr)?;
        let Some((next, next_guid)) = self.variables.next_name(&name, &guid) else {
            return Ok(EfiStatus::NotFound);
        };
        let needed = (next.encode_utf16().count() as u64 + 1) * 2;
        let room = req.trace.read_word(size_ptr)?;
        req.put_word(size_ptr, needed)?;
        if room < needed {
            return Ok(EfiStatus::BufferTooSmall);
        }
        let next = next.to_string();
        req.trace.write_ucs2(name_ptr, &next)?;
        req.trace.write(guid_ptr, &next_guid.to_bytes())?;
        Ok(EfiStatus::Success)
    }

    fn set_variable(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let name = req.trace.read_ucs2(req.arg(0)?, MAX_NAME)?;
        let guid = req.trace.read_guid(req.arg(1)?)?;
        let attributes = req.arg(2)? as u32;
        let size = req.arg(3)?;
        let data_ptr = req.arg(4)?;
        if name.is_empty() {
            return Ok(EfiStatus::InvalidParameter);
        }
        if size > MAX_VARIABLE_SIZE {
            return Ok(EfiStatus::OutOfResources);
        }
        let mut data = vec![0u8; size as usize];
        if size != 0 {
            if data_ptr == 0 {
                return Ok(EfiStatus::InvalidParameter);
            }
            req.trace.read(data_ptr, &mut data)?;
        }
        debug_service!("SetVariable {}:{} ({} bytes)", name, guid, size);
        if self.variables.set(&name, &guid, attributes, &data) {
            Ok(EfiStatus::Success)
        } else {
            Ok(EfiStatus::NotFound)
        }
    }

    fn query_variable_info(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let remaining = MAX_STORAGE.saturating_sub(self.variables.used());
        req.put_word(req.arg(1)?, MAX_STORAGE)?;
        req.put_word(req.arg(2)?, remaining)?;
        req.put_word(req.arg(3)?, MAX_VARIABLE_SIZE)?;
        Ok(EfiStatus::Success)
    }
}

impl Service for RuntimeServices {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        op::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        op::name(offset)
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            op::GET_TIME => self.get_time(req),
            op::SET_TIME
            | op::GET_WAKEUP_TIME
            | op::SET_WAKEUP_TIME
            | op::UPDATE_CAPSULE
            | op::QUERY_CAPSULE_CAPABILITIES => Ok(EfiStatus::Unsupported),
            // Addresses stay identity mapped.
            op::SET_VIRTUAL_ADDRESS_MAP | op::CONVERT_POINTER => Ok(EfiStatus::Success),
            op::GET_VARIABLE => self.get_variable(req),
            op::GET_NEXT_VARIABLE_NAME => self.get_next_variable_name(req),
            op::SET_VARIABLE => self.set_variable(req),
            op::GET_NEXT_HIGH_MONOTONIC_COUNT => {
                self.high_count = self.high_count.wrapping_add(1);
                let ptr = req.arg(0)?;
                if ptr == 0 {
                    return Ok(EfiStatus::InvalidParameter);
                }
                req.trace.write_u32(ptr, self.high_count)?;
                Ok(EfiStatus::Success)
            }
            op::RESET_SYSTEM => {
                let (kind, status) = (req.arg(0)?, req.arg(1)?);
                log::info!("ResetSystem type {} status {:#x}", kind, status);
                req.exit(super::exit_code(status));
                Ok(EfiStatus::Success)
            }
            op::QUERY_VARIABLE_INFO => self.query_variable_info(req),
            off if off < HEADER_SIZE => Err(Error::unsupported("call through table header")),
            off => Err(Error::unsupported(format!("runtime services slot {:#x}", off))),
        }
    }
}
