//! `EFI_BOOT_SERVICES`.
//!
//! Memory comes from the bump allocator and is never returned. Events are
//! bare ids with a signaled flag; nothing ever fires on its own, so waits
//! complete at once. Protocol lookups consult the handle registry first
//! and fall back to the service registered for the GUID, whose base then
//! doubles as the handle.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::table::{boot as op, open, search, HEADER_SIZE};
use crate::uefi::{memory_type, EfiStatus, Guid, MemoryDescriptor, MEMORY_ATTRIBUTES_ALL, POINTER_SIZE};
use crate::{debug_service, memory::layout};

use super::system_table::{seal_table, write_header};

pub const NAME: &str = "BootServices";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: None,
    aliases: &[],
    table_size: op::SIZE,
    create,
};

pub const PAGE_SIZE: u64 = 0x1000;
const POOL_ALIGN: u64 = 8;

/// `sizeof(EFI_MEMORY_DESCRIPTOR)` as reported to the guest.
pub const DESCRIPTOR_SIZE: u64 = std::mem::size_of::<MemoryDescriptor>() as u64;
const DESCRIPTOR_VERSION: u32 = 1;

pub const TPL_APPLICATION: u64 = 4;

const ALLOCATE_ADDRESS: u64 = 2;

/// First event id. Like handles, ids are kept clear of mapped memory.
const EVENT_SEED: u64 = 0xe7e7_0000_0000_0000;

/// Longest region CopyMem/SetMem/CalculateCrc32 will touch.
const MAX_BUFFER: u64 = 0x1000_0000;

fn create(_: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    write_header(trace, base, op::SIGNATURE, op::SIZE)?;
    seal_table(trace, base, op::SIZE)?;
    Ok(Box::new(BootServices::new()))
}

pub struct BootServices {
    tpl: u64,
    /// Event id to signaled.
    events: BTreeMap<u64, bool>,
    next_event: u64,
    monotonic: u64,
    map_key: u64,
}

impl Default for BootServices {
    fn default() -> Self {
        Self::new()
    }
}

fn read_guid_arg(req: &Request<'_>, n: usize) -> Result<Guid> {
    req.trace.read_guid(req.arg(n)?)
}

fn check_len(len: u64) -> Result<usize> {
    if len > MAX_BUFFER {
        return Err(Error::invalid(format!("buffer of {:#x} bytes", len)));
    }
    Ok(len as usize)
}

/// Interface for `guid` on `handle`, or the registered service as a
/// fallback.
fn lookup_interface(req: &mut Request<'_>, handle: u64, guid: &Guid) -> Result<Option<u64>> {
    if let Ok(interface) = req.dispatcher.handles().get(handle, guid) {
        return Ok(Some(interface));
    }
    if req.dispatcher.is_registered(guid) {
        return req.dispatcher.service_for_guid(req.trace, guid).map(Some);
    }
    Ok(None)
}

/// Handles matching a search, with the registered service standing in
/// when no handle carries the protocol.
fn search_handles(req: &mut Request<'_>, kind: u64, guid_arg: usize) -> Result<Option<Vec<u64>>> {
    match kind {
        search::ALL_HANDLES => Ok(Some(req.dispatcher.handles().all_handles())),
        search::BY_PROTOCOL => {
            let guid = read_guid_arg(req, guid_arg)?;
            let handles = req.dispatcher.handles().all_handles_by_guid(&guid);
            if !handles.is_empty() {
                return Ok(Some(handles));
            }
            if req.dispatcher.is_registered(&guid) {
                let base = req.dispatcher.service_for_guid(req.trace, &guid)?;
                // Building the service may have put it on a handle of its own.
                let handles = req.dispatcher.handles().all_handles_by_guid(&guid);
                return Ok(Some(if handles.is_empty() { vec![base] } else { handles }));
            }
            Ok(Some(Vec::new()))
        }
        _ => Ok(None),
    }
}

fn write_words(req: &mut Request<'_>, addr: u64, words: &[u64]) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    req.trace.write(addr, &bytes)
}

impl BootServices {
    pub fn new() -> Self {
        Self {
            tpl: TPL_APPLICATION,
            events: BTreeMap::new(),
            next_event: EVENT_SEED,
            monotonic: 0,
            map_key: 1,
        }
    }

    fn allocate_pages(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (kind, pages, memory) = (req.arg(0)?, req.arg(2)?, req.arg(3)?);
        if memory == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        if kind == ALLOCATE_ADDRESS {
            // The guest owns all of low RAM already.
            return Ok(EfiStatus::Success);
        }
        let Some(size) = pages.checked_mul(PAGE_SIZE) else {
            return Ok(EfiStatus::OutOfResources);
        };
        let Some(addr) = req.alloc(size, PAGE_SIZE) else {
            return Ok(EfiStatus::OutOfResources);
        };
        debug_service!("AllocatePages {} -> {:#x}", pages, addr);
        self.map_key += 1;
        req.put_word(memory, addr)?;
        Ok(EfiStatus::Success)
    }

    fn allocate_pool(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (size, buffer) = (req.arg(1)?, req.arg(2)?);
        if buffer == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let Some(addr) = req.alloc(size, POOL_ALIGN) else {
            return Ok(EfiStatus::OutOfResources);
        };
        debug_service!("AllocatePool {:#x} -> {:#x}", size, addr);
        self.map_key += 1;
        req.put_word(buffer, addr)?;
        Ok(EfiStatus::Success)
    }

    fn get_memory_map(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (size_ptr, map, key_ptr, desc_size_ptr, version_ptr) =
            (req.arg(0)?, req.arg(1)?, req.arg(2)?, req.arg(3)?, req.arg(4)?);
        if size_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let room = req.trace.read_word(size_ptr)?;
        req.put_word(size_ptr, DESCRIPTOR_SIZE)?;
        if desc_size_ptr != 0 {
            req.put_word(desc_size_ptr, DESCRIPTOR_SIZE)?;
        }
        if room < DESCRIPTOR_SIZE {
            return Ok(EfiStatus::BufferTooSmall);
        }
        if map == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let ram_end = req
            .trace
            .memory()
            .region(layout::LOW_RAM_START)
            .map(|r| r.end())
            .unwrap_or(0);
        let desc = MemoryDescriptor {
            memory_type: memory_type::CONVENTIONAL,
            physical_start: layout::LOW_RAM_START,
            virtual_start: layout::LOW_RAM_START,
            number_of_pages: (ram_end - layout::LOW_RAM_START) / PAGE_SIZE,
            attribute: MEMORY_ATTRIBUTES_ALL,
            ..Default::default()
        };
        req.trace.memory_mut().write_obj(map, &desc)?;
        if key_ptr != 0 {
            req.put_word(key_ptr, self.map_key)?;
        }
        if version_ptr != 0 {
            req.trace.write_u32(version_ptr, DESCRIPTOR_VERSION)?;
        }
        Ok(EfiStatus::Success)
    }

    fn create_event(&mut self, req: &mut Request<'_>, out_arg: usize) -> Result<EfiStatus> {
        let out = req.arg(out_arg)?;
        if out == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        self.next_event += 1;
        self.events.insert(self.next_event, false);
        req.put_word(out, self.next_event)?;
        Ok(EfiStatus::Success)
    }

    fn event_op(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let event = req.arg(0)?;
        let Some(signaled) = self.events.get_mut(&event) else {
            return Ok(EfiStatus::InvalidParameter);
        };
        match req.offset() {
            op::SET_TIMER | op::SIGNAL_EVENT => *signaled = true,
            op::CHECK_EVENT if !*signaled => return Ok(EfiStatus::NotReady),
            op::CHECK_EVENT => *signaled = false,
            _ => {
                self.events.remove(&event);
            }
        }
        Ok(EfiStatus::Success)
    }

    fn wait_for_event(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (count, index) = (req.arg(0)?, req.arg(2)?);
        if count == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        if index != 0 {
            req.put_word(index, 0)?;
        }
        Ok(EfiStatus::Success)
    }

    fn install_protocol_interface(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let handle_ptr = req.arg(0)?;
        let guid = read_guid_arg(req, 1)?;
        let interface = req.arg(3)?;
        if handle_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let mut handle = req.trace.read_word(handle_ptr)?;
        if handle == 0 {
            handle = req.dispatcher.handles_mut().create();
        }
        req.dispatcher.handles_mut().put(handle, guid, &[], interface)?;
        debug_service!("InstallProtocolInterface {} on {:#x}", guid, handle);
        req.put_word(handle_ptr, handle)?;
        Ok(EfiStatus::Success)
    }

    fn uninstall_protocol_interface(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let handle = req.arg(0)?;
        let guid = read_guid_arg(req, 1)?;
        req.dispatcher.handles_mut().remove(handle, &guid)?;
        Ok(EfiStatus::Success)
    }

    fn handle_protocol(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let handle = req.arg(0)?;
        let guid = read_guid_arg(req, 1)?;
        let out = req.arg(2)?;
        if out == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        match lookup_interface(req, handle, &guid)? {
            Some(interface) => {
                req.put_word(out, interface)?;
                Ok(EfiStatus::Success)
            }
            None => {
                debug_service!("HandleProtocol {} on {:#x}: none", guid, handle);
                Ok(EfiStatus::Unsupported)
            }
        }
    }

    fn open_protocol(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let handle = req.arg(0)?;
        let guid = read_guid_arg(req, 1)?;
        let out = req.arg(2)?;
        let attributes = req.arg(5)?;
        let accepted = open::BY_HANDLE_PROTOCOL
            | open::GET_PROTOCOL
            | open::TEST_PROTOCOL
            | open::BY_CHILD_CONTROLLER;
        if attributes == 0 || attributes & !accepted != 0 {
            return Ok(EfiStatus::Unsupported);
        }
        let test = attributes == open::TEST_PROTOCOL;
        if out == 0 && !test {
            return Ok(EfiStatus::InvalidParameter);
        }
        match lookup_interface(req, handle, &guid)? {
            Some(_) if test => Ok(EfiStatus::Success),
            Some(interface) => {
                req.put_word(out, interface)?;
                Ok(EfiStatus::Success)
            }
            None => Ok(EfiStatus::Unsupported),
        }
    }

    fn locate_handle(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (kind, count_ptr, buffer) = (req.arg(0)?, req.arg(3)?, req.arg(4)?);
        if count_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let Some(handles) = search_handles(req, kind, 1)? else {
            return Ok(EfiStatus::Unsupported);
        };
        if handles.is_empty() {
            return Ok(EfiStatus::NotFound);
        }
        // Capacity comes in and the count goes back in handles, not bytes.
        let capacity = req.trace.read_word(count_ptr)?;
        req.put_word(count_ptr, handles.len() as u64)?;
        if buffer == 0 || capacity < handles.len() as u64 {
            return Ok(EfiStatus::BufferTooSmall);
        }
        write_words(req, buffer, &handles)?;
        Ok(EfiStatus::Success)
    }

    fn locate_handle_buffer(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (kind, count_ptr, buffer_ptr) = (req.arg(0)?, req.arg(3)?, req.arg(4)?);
        if count_ptr == 0 || buffer_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let Some(handles) = search_handles(req, kind, 1)? else {
            return Ok(EfiStatus::Unsupported);
        };
        if handles.is_empty() {
            return Ok(EfiStatus::NotFound);
        }
        let Some(array) = req.alloc(handles.len() as u64 * POINTER_SIZE, POOL_ALIGN) else {
            return Ok(EfiStatus::OutOfResources);
        };
        write_words(req, array, &handles)?;
        req.put_word(count_ptr, handles.len() as u64)?;
        req.put_word(buffer_ptr, array)?;
        Ok(EfiStatus::Success)
    }

    fn locate_protocol(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let guid = read_guid_arg(req, 0)?;
        let out = req.arg(2)?;
        if out == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let first = req.dispatcher.handles().all_handles_by_guid(&guid).first().copied();
        let interface = match first {
            Some(handle) => Some(req.dispatcher.handles().get(handle, &guid)?),
            None if req.dispatcher.is_registered(&guid) => {
                Some(req.dispatcher.service_for_guid(req.trace, &guid)?)
            }
            None => None,
        };
        match interface {
            Some(interface) => {
                req.put_word(out, interface)?;
                Ok(EfiStatus::Success)
            }
            None => {
                req.put_word(out, 0)?;
                Ok(EfiStatus::NotFound)
            }
        }
    }

    fn protocols_per_handle(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (handle, buffer_ptr, count_ptr) = (req.arg(0)?, req.arg(1)?, req.arg(2)?);
        if buffer_ptr == 0 || count_ptr == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let guids = req.dispatcher.handles().protocols(handle)?;
        let n = guids.len() as u64;
        let guid_area = req.alloc(n * 16, POOL_ALIGN);
        let array = req.alloc(n * POINTER_SIZE, POOL_ALIGN);
        let (Some(guid_area), Some(array)) = (guid_area, array) else {
            return Ok(EfiStatus::OutOfResources);
        };
        let bytes: Vec<u8> = guids.iter().flat_map(|g| g.to_bytes()).collect();
        req.trace.write(guid_area, &bytes)?;
        let pointers: Vec<u64> = (0..n).map(|i| guid_area + i * 16).collect();
        write_words(req, array, &pointers)?;
        req.put_word(buffer_ptr, array)?;
        req.put_word(count_ptr, n)?;
        Ok(EfiStatus::Success)
    }

    fn calculate_crc32(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (data, size, out) = (req.arg(0)?, req.arg(1)?, req.arg(2)?);
        if data == 0 || size == 0 || out == 0 {
            return Ok(EfiStatus::InvalidParameter);
        }
        let mut bytes = vec![0u8; check_len(size)?];
        req.trace.read(data, &mut bytes)?;
        req.trace.write_u32(out, crc32fast::hash(&bytes))?;
        Ok(EfiStatus::Success)
    }

    fn copy_mem(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (dst, src, len) = (req.arg(0)?, req.arg(1)?, req.arg(2)?);
        let mut bytes = vec![0u8; check_len(len)?];
        req.trace.read(src, &mut bytes)?;
        req.trace.write(dst, &bytes)?;
        Ok(EfiStatus::Success)
    }

    fn set_mem(&self, req: &mut Request<'_>) -> Result<EfiStatus> {
        let (buf, len, value) = (req.arg(0)?, req.arg(1)?, req.arg(2)?);
        check_len(len)?;
        req.trace.memory_mut().fill(buf, len, value as u8)?;
        Ok(EfiStatus::Success)
    }
}

impl Service for BootServices {
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
            op::RAISE_TPL => {
                let old = std::mem::replace(&mut self.tpl, req.arg(0)?);
                req.return_value(old);
                Ok(EfiStatus::Success)
            }
            op::RESTORE_TPL => {
                self.tpl = req.arg(0)?;
                Ok(EfiStatus::Success)
            }
            op::ALLOCATE_PAGES => self.allocate_pages(req),
            op::FREE_PAGES | op::FREE_POOL => Ok(EfiStatus::Success),
            op::GET_MEMORY_MAP => self.get_memory_map(req),
            op::ALLOCATE_POOL => self.allocate_pool(req),
            op::CREATE_EVENT => self.create_event(req, 4),
            op::CREATE_EVENT_EX => self.create_event(req, 5),
            op::SET_TIMER | op::SIGNAL_EVENT | op::CLOSE_EVENT | op::CHECK_EVENT => {
                self.event_op(req)
            }
            op::WAIT_FOR_EVENT => self.wait_for_event(req),
            op::INSTALL_PROTOCOL_INTERFACE => self.install_protocol_interface(req),
            op::UNINSTALL_PROTOCOL_INTERFACE => self.uninstall_protocol_interface(req),
            op::HANDLE_PROTOCOL => self.handle_protocol(req),
            op::LOCATE_HANDLE => self.locate_handle(req),
            op::LOCATE_DEVICE_PATH => Ok(EfiStatus::NotFound),
            op::LOAD_IMAGE | op::START_IMAGE => Ok(EfiStatus::Unsupported),
            op::EXIT => {
                let status = req.arg(1)?;
                log::info!("Exit with status {:#x}", status);
                req.exit(super::exit_code(status));
                Ok(EfiStatus::Success)
            }
            op::UNLOAD_IMAGE => Ok(EfiStatus::Success),
            op::EXIT_BOOT_SERVICES => {
                log::info!("ExitBootServices");
                req.exit(0);
                Ok(EfiStatus::Success)
            }
            op::GET_NEXT_MONOTONIC_COUNT => {
                self.monotonic += 1;
                let out = req.arg(0)?;
                req.put_word(out, self.monotonic)?;
                Ok(EfiStatus::Success)
            }
            op::STALL
            | op::SET_WATCHDOG_TIMER
            | op::CONNECT_CONTROLLER
            | op::DISCONNECT_CONTROLLER
            | op::CLOSE_PROTOCOL => Ok(EfiStatus::Success),
            op::OPEN_PROTOCOL => self.open_protocol(req),
            op::OPEN_PROTOCOL_INFORMATION => Ok(EfiStatus::Unsupported),
            op::PROTOCOLS_PER_HANDLE => self.protocols_per_handle(req),
            op::LOCATE_HANDLE_BUFFER => self.locate_handle_buffer(req),
            op::LOCATE_PROTOCOL => self.locate_protocol(req),
            op::CALCULATE_CRC32 => self.calculate_crc32(req),
            op::COPY_MEM => self.copy_mem(req),
            op::SET_MEM => self.set_mem(req),
            off if off < HEADER_SIZE => Err(Error::unsupported("call through table header")),
            _ => Ok(EfiStatus::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Arch;
    use crate::services::collation;
    use crate::services::testing::{self, call, BUMP_BASE};
    use crate::uefi::guid::{LOADED_IMAGE, UNICODE_COLLATION2};

    const GUID_PTR: u64 = 0x2000;
    const OUT: u64 = 0x2100;
    const COUNT: u64 = 0x2108;

    #[test]
    fn test_locate_handle_by_protocol() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        t.write(GUID_PTR, &UNICODE_COLLATION2.to_bytes()).unwrap();
        t.write_word(COUNT, 1).unwrap();

        call(
            &mut t,
            &mut d,
            bs,
            op::LOCATE_HANDLE,
            &[search::BY_PROTOCOL, GUID_PTR, 0, COUNT, OUT],
        );
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(COUNT).unwrap(), 1);
        let collation = d.instantiate(&mut t, collation::NAME).unwrap();
        assert_eq!(t.read_word(OUT).unwrap(), collation);
    }

    #[test]
    fn test_locate_handle_reports_required_capacity() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        for _ in 0..3 {
            let h = d.handles_mut().create();
            d.install_protocol(&mut t, h, &LOADED_IMAGE).unwrap();
        }
        t.write(GUID_PTR, &LOADED_IMAGE.to_bytes()).unwrap();
        t.write_word(COUNT, 2).unwrap();
        t.write_word(OUT + 16, 0x5a5a).unwrap();

        let args = [search::BY_PROTOCOL, GUID_PTR, 0, COUNT, OUT];
        call(&mut t, &mut d, bs, op::LOCATE_HANDLE, &args);
        assert_eq!(t.regs.ret(), EfiStatus::BufferTooSmall.to_guest());
        assert_eq!(t.read_word(COUNT).unwrap(), 3);
        assert_eq!(t.read_word(OUT + 16).unwrap(), 0x5a5a);

        // Retrying with the reported count succeeds.
        call(&mut t, &mut d, bs, op::LOCATE_HANDLE, &args);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(COUNT).unwrap(), 3);
        assert_ne!(t.read_word(OUT + 16).unwrap(), 0x5a5a);
    }

    #[test]
    fn test_allocate_pool_advances_bump() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();

        call(&mut t, &mut d, bs, op::ALLOCATE_POOL, &[4, 0x40, OUT]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(OUT).unwrap(), BUMP_BASE);
        assert_eq!(d.space().bump_next(), BUMP_BASE + 0x40);

        call(&mut t, &mut d, bs, op::ALLOCATE_POOL, &[4, 0x80, OUT]);
        assert_eq!(t.read_word(OUT).unwrap(), BUMP_BASE + 0x40);
        assert_eq!(d.space().bump_next(), BUMP_BASE + 0xc0);
    }

    #[test]
    fn test_allocate_pages_is_page_aligned() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        call(&mut t, &mut d, bs, op::ALLOCATE_POOL, &[4, 0x10, OUT]);
        call(&mut t, &mut d, bs, op::ALLOCATE_PAGES, &[0, 4, 2, OUT]);
        assert_eq!(t.read_word(OUT).unwrap(), BUMP_BASE + PAGE_SIZE);
        assert_eq!(d.space().bump_next(), BUMP_BASE + 3 * PAGE_SIZE);
    }

    #[test]
    fn test_memory_map() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        let (size, map, key, desc, ver) = (0x2000, 0x3000, 0x2008, 0x2010, 0x2018);

        t.write_word(size, 0).unwrap();
        call(&mut t, &mut d, bs, op::GET_MEMORY_MAP, &[size, map, key, desc, ver]);
        assert_eq!(t.regs.ret(), EfiStatus::BufferTooSmall.to_guest());
        assert_eq!(t.read_word(size).unwrap(), 48);

        call(&mut t, &mut d, bs, op::GET_MEMORY_MAP, &[size, map, key, desc, ver]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(desc).unwrap(), 48);
        assert_eq!(t.read_u32(ver).unwrap(), 1);
        assert_eq!(t.read_u32(map).unwrap(), memory_type::CONVENTIONAL);
        // 16 MiB of fake low RAM.
        assert_eq!(t.read_word(map + 24).unwrap(), 0x1000);
    }

    #[test]
    fn test_tpl_and_events() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();

        call(&mut t, &mut d, bs, op::RAISE_TPL, &[16]);
        assert_eq!(t.regs.ret(), TPL_APPLICATION);
        call(&mut t, &mut d, bs, op::RESTORE_TPL, &[TPL_APPLICATION]);
        call(&mut t, &mut d, bs, op::RAISE_TPL, &[8]);
        assert_eq!(t.regs.ret(), TPL_APPLICATION);

        call(&mut t, &mut d, bs, op::CREATE_EVENT, &[0, 8, 0, 0, OUT]);
        let event = t.read_word(OUT).unwrap();
        assert!(event > EVENT_SEED);

        call(&mut t, &mut d, bs, op::CHECK_EVENT, &[event]);
        assert_eq!(t.regs.ret(), EfiStatus::NotReady.to_guest());
        call(&mut t, &mut d, bs, op::SIGNAL_EVENT, &[event]);
        call(&mut t, &mut d, bs, op::CHECK_EVENT, &[event]);
        assert_eq!(t.regs.ret(), 0);

        t.write_word(0x2200, event).unwrap();
        call(&mut t, &mut d, bs, op::WAIT_FOR_EVENT, &[1, 0x2200, COUNT]);
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.read_word(COUNT).unwrap(), 0);
        call(&mut t, &mut d, bs, op::WAIT_FOR_EVENT, &[0, 0x2200, COUNT]);
        assert_eq!(t.regs.ret(), EfiStatus::InvalidParameter.to_guest());

        call(&mut t, &mut d, bs, op::CLOSE_EVENT, &[event]);
        call(&mut t, &mut d, bs, op::CLOSE_EVENT, &[event]);
        assert_eq!(t.regs.ret(), EfiStatus::InvalidParameter.to_guest());
    }

    #[test]
    fn test_install_and_handle_protocol() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        let mine = Guid::new(0x1234_5678, 1, 2, [3; 8]);
        t.write(GUID_PTR, &mine.to_bytes()).unwrap();
        t.write_word(0x2200, 0).unwrap();

        call(&mut t, &mut d, bs, op::INSTALL_PROTOCOL_INTERFACE, &[0x2200, GUID_PTR, 0, 0xabc0]);
        assert_eq!(t.regs.ret(), 0);
        let handle = t.read_word(0x2200).unwrap();
        assert!(d.handles().contains(handle));

        call(&mut t, &mut d, bs, op::HANDLE_PROTOCOL, &[handle, GUID_PTR, OUT]);
        assert_eq!(t.read_word(OUT).unwrap(), 0xabc0);

        call(&mut t, &mut d, bs, op::LOCATE_PROTOCOL, &[GUID_PTR, 0, OUT]);
        assert_eq!(t.read_word(OUT).unwrap(), 0xabc0);

        call(&mut t, &mut d, bs, op::PROTOCOLS_PER_HANDLE, &[handle, OUT, COUNT]);
        assert_eq!(t.read_word(COUNT).unwrap(), 1);
        let array = t.read_word(OUT).unwrap();
        assert_eq!(t.read_guid(t.read_word(array).unwrap()).unwrap(), mine);

        t.write(GUID_PTR, &LOADED_IMAGE.to_bytes()).unwrap();
        call(&mut t, &mut d, bs, op::HANDLE_PROTOCOL, &[handle, GUID_PTR, OUT]);
        let loaded_image = d.instantiate(&mut t, crate::services::loaded_image::NAME).unwrap();
        assert_eq!(t.read_word(OUT).unwrap(), loaded_image);

        let unknown = Guid::new(0xdead, 0, 0, [0; 8]);
        t.write(GUID_PTR, &unknown.to_bytes()).unwrap();
        call(&mut t, &mut d, bs, op::HANDLE_PROTOCOL, &[handle, GUID_PTR, OUT]);
        assert_eq!(t.regs.ret(), EfiStatus::Unsupported.to_guest());
    }

    #[test]
    fn test_open_protocol_attributes() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        t.write(GUID_PTR, &UNICODE_COLLATION2.to_bytes()).unwrap();

        call(&mut t, &mut d, bs, op::OPEN_PROTOCOL, &[0, GUID_PTR, OUT, 0, 0, open::GET_PROTOCOL]);
        assert_eq!(t.regs.ret(), 0);
        call(&mut t, &mut d, bs, op::OPEN_PROTOCOL, &[0, GUID_PTR, 0, 0, 0, open::TEST_PROTOCOL]);
        assert_eq!(t.regs.ret(), 0);
        call(&mut t, &mut d, bs, op::OPEN_PROTOCOL, &[0, GUID_PTR, 0, 0, 0, open::GET_PROTOCOL]);
        assert_eq!(t.regs.ret(), EfiStatus::InvalidParameter.to_guest());
        call(&mut t, &mut d, bs, op::OPEN_PROTOCOL, &[0, GUID_PTR, OUT, 0, 0, open::EXCLUSIVE]);
        assert_eq!(t.regs.ret(), EfiStatus::Unsupported.to_guest());
    }

    #[test]
    fn test_memory_helpers_and_exit() {
        let (mut t, mut d) = testing::setup(Arch::Aarch64);
        let bs = d.instantiate(&mut t, NAME).unwrap();
        t.write(0x3000, b"123456789").unwrap();

        call(&mut t, &mut d, bs, op::CALCULATE_CRC32, &[0x3000, 9, OUT]);
        assert_eq!(t.read_u32(OUT).unwrap(), 0xcbf4_3926);

        call(&mut t, &mut d, bs, op::COPY_MEM, &[0x3100, 0x3000, 9]);
        call(&mut t, &mut d, bs, op::SET_MEM, &[0x3100, 3, 0x41]);
        let mut b = [0u8; 9];
        t.read(0x3100, &mut b).unwrap();
        assert_eq!(&b, b"AAA456789");

        let done = call(&mut t, &mut d, bs, op::LOAD_IMAGE, &[0; 6]);
        assert_eq!(done.status, Some(EfiStatus::Unsupported));
        assert_eq!(done.exit, None);

        let done = call(&mut t, &mut d, bs, op::EXIT_BOOT_SERVICES, &[0, 1]);
        assert_eq!(done.exit, Some(0));
    }
}
