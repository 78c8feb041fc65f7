//! Routing faults to services.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::HandleRegistry;
use super::space::{resolve, ServPtr, ServiceSpace};
use crate::decode::{self, Op, Recovered};
use crate::error::{Error, Result};
use crate::fault::Fault;
use crate::loader::ImageInfo;
use crate::memory::layout::SERVICE_TRAP_BASE;
use crate::regs::{Arch, Regs, X64_STACK_ARGS_OFFSET};
use crate::trace::Trace;
use crate::uefi::{EfiStatus, Guid, POINTER_SIZE};
use crate::{debug_dispatch, debug_service};

/// A host-emulated UEFI protocol or table.
pub trait Service: Send {
    fn name(&self) -> &str;

    /// Size in bytes of the slot table at the service base.
    fn table_size(&self) -> u64;

    /// Name of the operation at `offset`, for logs.
    fn describe(&self, _offset: u64) -> &'static str {
        "?"
    }

    /// The guest called through slot `req.offset()`.
    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus>;

    /// The guest read slot `req.offset()` from unmapped memory. The value
    /// returned lands in the destination register.
    fn load(&mut self, req: &mut Request<'_>) -> Result<u64> {
        Ok(req.ptr.addr())
    }

    /// The guest wrote `value` to slot `req.offset()`.
    fn store(&mut self, req: &mut Request<'_>, value: u64) -> Result<()> {
        Err(Error::unsupported(format!(
            "store of {:#x} to {} at {}",
            value,
            self.name(),
            req.ptr
        )))
    }
}

type ServiceRef = Arc<Mutex<Box<dyn Service>>>;

/// Builds a service whose table has been laid out at `base`.
pub type Creator = fn(&mut Dispatcher, &mut dyn Trace, u64) -> Result<Box<dyn Service>>;

/// How to build a service on demand.
#[derive(Clone, Copy)]
pub struct Registration {
    pub name: &'static str,
    pub guid: Option<Guid>,
    /// Further GUIDs the same service answers to.
    pub aliases: &'static [Guid],
    pub table_size: u64,
    pub create: Creator,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("guid", &self.guid)
            .field("table_size", &self.table_size)
            .finish()
    }
}

/// Settings that services consult.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Read console input from host stdin.
    pub handle_console_io: bool,
}

/// One service invocation.
pub struct Request<'a> {
    pub trace: &'a mut dyn Trace,
    pub dispatcher: &'a mut Dispatcher,
    /// Registers at the trap. Changes are written back after the service
    /// returns.
    pub regs: Regs,
    pub ptr: ServPtr,
    pub fault: &'a Fault,
    stack_args: u64,
    exit: Option<i32>,
    value: Option<u64>,
}

impl Request<'_> {
    pub fn offset(&self) -> u64 {
        self.ptr.offset
    }

    /// Argument `n` of the call, per the UEFI calling convention.
    pub fn arg(&self, n: usize) -> Result<u64> {
        if let Some(v) = self.regs.register_arg(n) {
            return Ok(v);
        }
        let first = self.regs.arch().register_args();
        self.trace
            .read_word(self.stack_args + (n - first) as u64 * POINTER_SIZE)
    }

    /// Write a word through a guest out-pointer.
    pub fn put_word(&mut self, ptr: u64, val: u64) -> Result<()> {
        if ptr == 0 {
            return Err(Error::invalid("null output pointer"));
        }
        self.trace.write_word(ptr, val)
    }

    /// Carve guest memory from the bump allocator.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        self.dispatcher.space_mut().bump().alloc(size, align)
    }

    /// Stop the guest once this call returns.
    pub fn exit(&mut self, code: i32) {
        self.exit = Some(code);
    }

    /// Return `value` instead of a status, for the few protocol functions
    /// that return an integer or BOOLEAN.
    pub fn return_value(&mut self, value: u64) {
        self.value = Some(value);
    }
}

/// What a dispatch did.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub ptr: ServPtr,
    pub op: Op,
    pub site: Recovered,
    /// Status written to the return register for calls.
    pub status: Option<EfiStatus>,
    /// Exit code requested by the service.
    pub exit: Option<i32>,
}

/// The dispatch table plus the registries services share.
pub struct Dispatcher {
    dispatches: BTreeMap<u64, ServiceRef>,
    by_name: HashMap<&'static str, Registration>,
    by_guid: HashMap<Guid, &'static str>,
    instances: HashMap<&'static str, u64>,
    space: ServiceSpace,
    handles: HandleRegistry,
    options: ServiceOptions,
    image: Option<ImageInfo>,
}

impl Dispatcher {
    pub fn new(space: ServiceSpace, options: ServiceOptions) -> Self {
        Self {
            dispatches: BTreeMap::new(),
            by_name: HashMap::new(),
            by_guid: HashMap::new(),
            instances: HashMap::new(),
            space,
            handles: HandleRegistry::new(),
            options,
            image: None,
        }
    }

    pub fn arch(&self) -> Arch {
        self.space.arch()
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn space(&self) -> &ServiceSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut ServiceSpace {
        &mut self.space
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleRegistry {
        &mut self.handles
    }

    pub fn image(&self) -> Option<&ImageInfo> {
        self.image.as_ref()
    }

    pub fn set_image(&mut self, image: ImageInfo) {
        self.image = Some(image);
    }

    /// Make a service constructible by name and GUID.
    pub fn register(&mut self, reg: Registration) -> Result<()> {
        if self.by_name.contains_key(reg.name) {
            return Err(Error::DuplicateRegistration(reg.name.to_string()));
        }
        let guids: Vec<Guid> = reg.guid.iter().chain(reg.aliases).copied().collect();
        if let Some(g) = guids.iter().find(|g| self.by_guid.contains_key(g)) {
            return Err(Error::DuplicateRegistration(g.to_string()));
        }
        for g in guids {
            self.by_guid.insert(g, reg.name);
        }
        self.by_name.insert(reg.name, reg);
        Ok(())
    }

    pub fn is_registered(&self, guid: &Guid) -> bool {
        self.by_guid.contains_key(guid)
    }

    pub fn registration(&self, name: &str) -> Option<&Registration> {
        self.by_name.get(name)
    }

    /// Base of the named service, building it on first use.
    pub fn instantiate(&mut self, trace: &mut dyn Trace, name: &str) -> Result<u64> {
        if let Some(&base) = self.instances.get(name) {
            return Ok(base);
        }
        let reg = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;
        let base = self.space.alloc_base()?;
        self.space
            .fill_table(trace.memory_mut(), base, reg.table_size)?;
        let service = (reg.create)(self, trace, base)?;
        self.bind(base, service)?;
        self.instances.insert(reg.name, base);
        debug_service!("{} at {:#x}", reg.name, base);
        Ok(base)
    }

    /// Base of the service answering to `guid`, building it on first use.
    pub fn service_for_guid(&mut self, trace: &mut dyn Trace, guid: &Guid) -> Result<u64> {
        let name = *self
            .by_guid
            .get(guid)
            .ok_or_else(|| Error::UnknownService(guid.to_string()))?;
        self.instantiate(trace, name)
    }

    /// Bind `guid` (and the aliases of its service) on `handle` to the
    /// registered service.
    pub fn install_protocol(
        &mut self,
        trace: &mut dyn Trace,
        handle: u64,
        guid: &Guid,
    ) -> Result<u64> {
        let base = self.service_for_guid(trace, guid)?;
        let aliases = self
            .by_guid
            .get(guid)
            .and_then(|name| self.by_name.get(name))
            .map(|r| r.aliases)
            .unwrap_or(&[]);
        self.handles.put(handle, *guid, aliases, base)?;
        Ok(base)
    }

    /// Serve `service` at a fixed base outside the allocated space.
    pub fn register_at(&mut self, base: u64, service: Box<dyn Service>) -> Result<()> {
        if base & super::space::OFFSET_MASK != 0 {
            return Err(Error::invalid(format!("service base {:#x} is not aligned", base)));
        }
        self.bind(base, service)
    }

    fn bind(&mut self, base: u64, service: Box<dyn Service>) -> Result<()> {
        if self.dispatches.contains_key(&base) {
            return Err(Error::DuplicateBase(base));
        }
        self.dispatches.insert(base, Arc::new(Mutex::new(service)));
        Ok(())
    }

    /// Serve the service at `base` from `alias` as well.
    pub fn alias(&mut self, base: u64, alias: u64) -> Result<()> {
        let service = self.lookup(base).ok_or(Error::NoService(base))?;
        if self.dispatches.contains_key(&alias) {
            return Err(Error::DuplicateBase(alias));
        }
        self.dispatches.insert(alias, service);
        Ok(())
    }

    fn lookup(&self, base: u64) -> Option<ServiceRef> {
        self.dispatches.get(&base).cloned()
    }

    pub fn is_bound(&self, base: u64) -> bool {
        self.dispatches.contains_key(&base)
    }

    /// Handle a fault that touched the service space.
    ///
    /// Calls that fail with a guest-visible error still complete: the
    /// status lands in the return register and the guest resumes. Failed
    /// loads and stores, unknown bases and undecodable sites return the
    /// error with the guest PC untouched.
    pub fn dispatch(&mut self, trace: &mut dyn Trace, fault: &Fault) -> Result<Dispatched> {
        let site = decode::recover(&*trace, fault)?;
        let target = match fault.mmio() {
            Some((phys, _, _)) => phys,
            None => fault.addr,
        };
        let ptr = resolve(target);
        let service_ref = self.lookup(ptr.base).ok_or(Error::NoService(ptr.base))?;
        let mut service = service_ref.lock();

        debug_dispatch!(
            "{:?} {} {} `{}` via {}",
            site.op,
            service.name(),
            service.describe(ptr.offset),
            site.text,
            ptr
        );

        let stack_args = match fault.regs.arch() {
            Arch::X86_64 if site.returned_into_trap => fault.regs.sp() + X64_STACK_ARGS_OFFSET,
            Arch::X86_64 => fault.regs.sp() + X64_STACK_ARGS_OFFSET - POINTER_SIZE,
            Arch::Aarch64 => fault.regs.sp(),
        };
        let mut req = Request {
            trace: &mut *trace,
            dispatcher: self,
            regs: fault.regs.clone(),
            ptr,
            fault,
            stack_args,
            exit: None,
            value: None,
        };

        let in_table = ptr.offset % POINTER_SIZE == 0 && ptr.offset < service.table_size();
        let mut status = None;
        let mut reply = None;
        match site.op {
            Op::Call => {
                let result = if in_table {
                    service.call(&mut req)
                } else {
                    Err(Error::invalid(format!("{} has no slot {:#x}", service.name(), ptr.offset)))
                };
                let st = match result {
                    Ok(st) => st,
                    Err(e) if e.kind().is_guest_visible() => {
                        log::warn!("{} {}: {}", service.name(), service.describe(ptr.offset), e);
                        e.kind().status()
                    }
                    Err(e) => return Err(e),
                };
                let ret = req.value.filter(|_| !st.is_error()).unwrap_or(st.to_guest());
                req.regs.set_ret(ret);
                if let Some(lr) = req.regs.link().filter(|_| site.returned_into_trap) {
                    req.regs.set_pc(lr);
                }
                status = Some(st);
                // A call replayed by the hypervisor jumps to the reply; send
                // it to the `ret` of the first trap cell.
                reply = Some(SERVICE_TRAP_BASE + 1);
            }
            Op::Load { dst } => {
                if !in_table {
                    return Err(Error::invalid(format!(
                        "{} has no slot {:#x}",
                        service.name(),
                        ptr.offset
                    )));
                }
                let value = service.load(&mut req)?;
                req.regs.set_gpr(dst, value);
                reply = Some(value);
            }
            Op::Store => {
                let value = fault.mmio_write_value().unwrap_or(0);
                service.store(&mut req, value)?;
            }
        }
        drop(service);

        let Request { regs, exit, .. } = req;
        trace.set_regs(&regs)?;
        if !site.returned_into_trap {
            trace.complete_mmio(reply, site.len)?;
        }
        if let Some(st) = status.filter(|s| s.is_error()) {
            debug_dispatch!("{} returned {}", ptr, st);
        }
        Ok(Dispatched {
            ptr,
            op: site.op,
            site,
            status,
            exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fault::{ExitKind, Payload};
    use crate::memory::layout::TRAP_OFFSET;
    use crate::trace::testing::FakeTrace;

    /// Answers every call with a fixed status and records the last offset.
    struct Recorder {
        status: Result<EfiStatus>,
        last: Arc<Mutex<Option<u64>>>,
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            "Recorder"
        }

        fn table_size(&self) -> u64 {
            0x100
        }

        fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
            *self.last.lock() = Some(req.offset());
            match &self.status {
                Ok(s) => Ok(*s),
                Err(e) => Err(Error::invalid(e.to_string())),
            }
        }
    }

    fn recorder(status: Result<EfiStatus>) -> (Box<dyn Service>, Arc<Mutex<Option<u64>>>) {
        let last = Arc::new(Mutex::new(None));
        (
            Box::new(Recorder {
                status,
                last: last.clone(),
            }),
            last,
        )
    }

    fn dispatcher(arch: Arch) -> Dispatcher {
        Dispatcher::new(
            ServiceSpace::new(arch, 0x40_0000, 0x80_0000),
            ServiceOptions::default(),
        )
    }

    fn mmio(trace: &FakeTrace, pc: u64, addr: u64, is_write: bool, data: u64) -> Fault {
        let mut regs = trace.regs.clone();
        regs.set_pc(pc);
        Fault::new(
            ExitKind::Mmio,
            addr,
            Payload::Mmio {
                phys_addr: addr,
                data: data.to_le_bytes(),
                len: 8,
                is_write,
            },
            regs,
        )
    }

    #[test]
    fn test_mmio_call_sets_status_and_advances() {
        let mut t = FakeTrace::new(Arch::X86_64);
        // mov rax, 0xef000000; call [rax]; hlt
        let code = [
            0x48, 0xb8, 0x00, 0x00, 0x00, 0xef, 0x00, 0x00, 0x00, 0x00, 0xff, 0x10, 0xf4,
        ];
        t.write(0x1000, &code).unwrap();
        t.regs.set_ret(0xef00_0000);
        let mut d = dispatcher(Arch::X86_64);
        let (svc, last) = recorder(Ok(EfiStatus::Success));
        d.register_at(0xef00_0000, svc).unwrap();

        let fault = mmio(&t, 0x100a, 0xef00_0000, false, 0);
        let done = d.dispatch(&mut t, &fault).unwrap();

        assert_eq!(done.op, Op::Call);
        assert_eq!(done.status, Some(EfiStatus::Success));
        assert_eq!(*last.lock(), Some(0));
        assert_eq!(t.regs.ret(), 0);
        assert_eq!(t.regs.pc(), 0x100c);
        assert_eq!(t.mmio_replies, vec![Some(SERVICE_TRAP_BASE + 1)]);
    }

    #[test]
    fn test_load_forwards_slot_address() {
        let mut t = FakeTrace::new(Arch::X86_64);
        // mov rcx, [rax+8]
        t.write(0x1000, &[0x48, 0x8b, 0x48, 0x08]).unwrap();
        let mut d = dispatcher(Arch::X86_64);
        let (svc, _) = recorder(Ok(EfiStatus::Success));
        d.register_at(0xef00_0000, svc).unwrap();

        let fault = mmio(&t, 0x1000, 0xef00_0008, false, 0);
        let done = d.dispatch(&mut t, &fault).unwrap();

        assert_eq!(done.op, Op::Load { dst: 1 });
        assert_eq!(t.regs.gpr(1), Some(0xef00_0008));
        assert_eq!(t.regs.pc(), 0x1004);
        assert_eq!(t.mmio_replies, vec![Some(0xef00_0008)]);
    }

    #[test]
    fn test_rejected_store_leaves_pc() {
        let mut t = FakeTrace::new(Arch::X86_64);
        // mov [rax], rbx
        t.write(0x1000, &[0x48, 0x89, 0x18]).unwrap();
        let mut d = dispatcher(Arch::X86_64);
        let (svc, _) = recorder(Ok(EfiStatus::Success));
        d.register_at(0xef00_0000, svc).unwrap();

        let fault = mmio(&t, 0x1000, 0xef00_0010, true, 7);
        let err = d.dispatch(&mut t, &fault).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(t.regs.pc(), 0);
        assert!(t.mmio_replies.is_empty());
    }

    #[test]
    fn test_unbound_base_is_not_found() {
        let mut t = FakeTrace::new(Arch::X86_64);
        t.write(0x1000, &[0xff, 0x10]).unwrap();
        let mut d = dispatcher(Arch::X86_64);
        let fault = mmio(&t, 0x1000, 0xee00_0000, false, 0);
        let err = d.dispatch(&mut t, &fault).unwrap_err();
        assert!(matches!(err, Error::NoService(0xee00_0000)));
    }

    #[test]
    fn test_guest_visible_error_still_completes_call() {
        let mut t = FakeTrace::new(Arch::X86_64);
        t.write(0x1000, &[0xff, 0x10]).unwrap();
        let mut d = dispatcher(Arch::X86_64);
        let (svc, _) = recorder(Err(Error::invalid("bad")));
        d.register_at(0xef00_0000, svc).unwrap();

        let fault = mmio(&t, 0x1000, 0xef00_0000, false, 0);
        let done = d.dispatch(&mut t, &fault).unwrap();
        assert_eq!(done.status, Some(EfiStatus::InvalidParameter));
        assert_eq!(t.regs.ret(), EfiStatus::InvalidParameter.to_guest());
        assert_eq!(t.regs.pc(), 0x1002);
    }

    #[test]
    fn test_trap_half_call_amd64() {
        let mut t = FakeTrace::new(Arch::X86_64);
        let mut d = dispatcher(Arch::X86_64);
        let (svc, last) = recorder(Ok(EfiStatus::Success));
        d.register_at(0xff01_0000, svc).unwrap();

        // call [rax+0x40] at 0x1000, returning to 0x1003
        t.write(0x1000, &[0xff, 0x50, 0x40]).unwrap();
        let mut regs = t.regs.clone();
        t.push(&mut regs, 0x1003).unwrap();
        let cell = 0xff01_0040 + TRAP_OFFSET;
        regs.set_pc(cell + 1);
        let fault = Fault::new(ExitKind::Halt, cell, Payload::None, regs);

        let done = d.dispatch(&mut t, &fault).unwrap();
        assert_eq!(done.ptr, ServPtr { base: 0xff01_0000, offset: 0x40 });
        assert_eq!(*last.lock(), Some(0x40));
        // Resumes on the cell's `ret`.
        assert_eq!(t.regs.pc(), cell + 1);
        assert_eq!(t.regs.ret(), 0);
        assert!(t.mmio_replies.is_empty());
    }

    #[test]
    fn test_trap_half_call_arm64_returns_to_lr() {
        let mut t = FakeTrace::new(Arch::Aarch64);
        let mut d = dispatcher(Arch::Aarch64);
        let (svc, _) = recorder(Ok(EfiStatus::NotReady));
        d.register_at(0xff02_0000, svc).unwrap();

        t.write_u32(0x2000, 0xd63f_0100).unwrap();
        let mut regs = t.regs.clone();
        regs.set_gpr(30, 0x2004);
        let cell = 0xff02_0008 + TRAP_OFFSET;
        regs.set_pc(cell);
        let fault = Fault::new(ExitKind::Debug, cell, Payload::None, regs);

        d.dispatch(&mut t, &fault).unwrap();
        assert_eq!(t.regs.pc(), 0x2004);
        assert_eq!(t.regs.ret(), EfiStatus::NotReady.to_guest());
    }

    #[test]
    fn test_stack_arguments() {
        struct Fifth(Arc<Mutex<u64>>);
        impl Service for Fifth {
            fn name(&self) -> &str {
                "Fifth"
            }
            fn table_size(&self) -> u64 {
                8
            }
            fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
                *self.0.lock() = req.arg(4)?;
                Ok(EfiStatus::Success)
            }
        }

        let mut t = FakeTrace::new(Arch::X86_64);
        let mut d = dispatcher(Arch::X86_64);
        let seen = Arc::new(Mutex::new(0));
        d.register_at(0xff03_0000, Box::new(Fifth(seen.clone()))).unwrap();

        t.write(0x1000, &[0xff, 0x10]).unwrap();
        let mut regs = t.regs.clone();
        // Caller's frame: shadow space then the fifth argument.
        t.write_word(regs.sp() + 0x20, 0x5555).unwrap();
        t.push(&mut regs, 0x1002).unwrap();
        let cell = 0xff03_0000 + TRAP_OFFSET;
        regs.set_pc(cell + 1);
        let fault = Fault::new(ExitKind::Halt, cell, Payload::None, regs);

        d.dispatch(&mut t, &fault).unwrap();
        assert_eq!(*seen.lock(), 0x5555);
    }

    #[test]
    fn test_duplicate_bases_and_aliases() {
        let mut d = dispatcher(Arch::X86_64);
        let (a, _) = recorder(Ok(EfiStatus::Success));
        let (b, _) = recorder(Ok(EfiStatus::Success));
        d.register_at(0xef00_0000, a).unwrap();
        assert!(matches!(
            d.register_at(0xef00_0000, b),
            Err(Error::DuplicateBase(_))
        ));
        d.alias(0xef00_0000, 0xef01_0000).unwrap();
        assert!(d.is_bound(0xef01_0000));
        assert!(d.alias(0xef00_0000, 0xef01_0000).is_err());
        let (c, _) = recorder(Ok(EfiStatus::Success));
        assert!(d.register_at(0xef00_0008, c).is_err());
    }
}
