//! The emulator: one guest, its services and the step loop.

use std::io::Write;

use crate::builder::EmulatorBuilder;
use crate::error::{Error, Result};
use crate::fault::{ExitKind, Fault, Payload};
use crate::loader::{ImageInfo, ImageLoader};
use crate::memory::layout::ENTRY_RETURN_TRAP;
use crate::regs::{Arch, Regs};
use crate::service::space::resolve;
use crate::service::{Dispatcher, ServiceOptions, ServiceSpace};
use crate::services::{self, Entry};
use crate::trace::Trace;
use crate::{debug_dispatch, debug_kvm};

/// arm64 exception classes for a software step.
const ESR_EC_SOFTWARE_STEP: [u32; 2] = [0x32, 0x33];

/// The state of an [`Emulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    /// Image loaded, entry point not yet entered.
    Ready,
    /// The guest has been entered at least once.
    Running,
    /// The guest finished with an exit code.
    Exited(i32),
    /// The guest hit an exit that could not be serviced.
    Failed,
}

impl std::fmt::Display for EmulatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmulatorState::Ready => write!(f, "ready"),
            EmulatorState::Running => write!(f, "running"),
            EmulatorState::Exited(code) => write!(f, "exited({})", code),
            EmulatorState::Failed => write!(f, "failed"),
        }
    }
}

/// What one [`Emulator::step`] did.
#[derive(Debug)]
pub enum StepOutcome {
    /// The exit was handled; the guest can be entered again.
    Continue(Fault),
    /// The guest is done. Carries the process exit code.
    Exited(i32),
    /// Nothing could service the exit. `error` says why when dispatch
    /// was attempted.
    Stopped { fault: Fault, error: Option<Error> },
}

/// Settings for [`Emulator::boot`].
#[derive(Debug, Clone)]
pub struct BootOptions {
    pub bump_base: u64,
    pub bump_limit: u64,
    pub handle_console_io: bool,
    pub singlestep: bool,
}

/// An EFI application running on a hypervisor with its UEFI services
/// emulated on the host.
///
/// # Example
///
/// ```rust,no_run
/// use efivm::Emulator;
///
/// let mut emu = Emulator::builder()
///     .image("hello.efi")
///     .handle_console_io(true)
///     .build()?;
/// let code = emu.run()?;
/// std::process::exit(code);
/// # Ok::<(), efivm::Error>(())
/// ```
pub struct Emulator {
    trace: Box<dyn Trace>,
    dispatcher: Dispatcher,
    image: ImageInfo,
    entry: Entry,
    state: EmulatorState,
    singlestep: bool,
    regs_out: Option<Box<dyn Write + Send>>,
    exits: u64,
}

impl Emulator {
    /// Create a new emulator builder.
    pub fn builder() -> EmulatorBuilder {
        EmulatorBuilder::new()
    }

    /// Poison the service space, load the image, install the services
    /// and point the vCPU at the entry point.
    pub fn boot(
        mut trace: Box<dyn Trace>,
        loader: &ImageLoader,
        options: &BootOptions,
        mut regs_out: Option<Box<dyn Write + Send>>,
    ) -> Result<Self> {
        let arch = trace.arch();
        let space = ServiceSpace::new(arch, options.bump_base, options.bump_limit);
        space.poison(trace.memory_mut())?;

        let mut dispatcher = Dispatcher::new(
            space,
            ServiceOptions {
                handle_console_io: options.handle_console_io,
            },
        );
        services::register_all(&mut dispatcher)?;

        let image = loader.load(trace.memory_mut())?;
        log::info!(
            "loaded {:?} image at {:#x}+{:#x}, entry {:#x}",
            image.format,
            image.image_base,
            image.image_size,
            image.entry
        );
        let entry = services::install(&mut dispatcher, &mut *trace, &image)?;
        services::prepare_entry(&mut *trace, &image, &entry)?;

        if options.singlestep {
            trace.single_step(true)?;
        }
        if let Some(out) = regs_out.as_mut() {
            writeln!(out, "{}", Regs::csv_header(arch))?;
        }

        Ok(Self {
            trace,
            dispatcher,
            image,
            entry,
            state: EmulatorState::Ready,
            singlestep: options.singlestep,
            regs_out,
            exits: 0,
        })
    }

    pub fn state(&self) -> EmulatorState {
        self.state
    }

    pub fn arch(&self) -> Arch {
        self.trace.arch()
    }

    pub fn image(&self) -> &ImageInfo {
        &self.image
    }

    /// Image handle and system table handed to the entry point.
    pub fn entry(&self) -> Entry {
        self.entry
    }

    /// Number of VM exits seen so far.
    pub fn exits(&self) -> u64 {
        self.exits
    }

    pub fn trace(&self) -> &dyn Trace {
        &*self.trace
    }

    pub fn trace_mut(&mut self) -> &mut dyn Trace {
        &mut *self.trace
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Enter the guest once and handle the exit.
    pub fn step(&mut self) -> Result<StepOutcome> {
        match self.state {
            EmulatorState::Ready | EmulatorState::Running => {}
            _ => {
                return Err(Error::InvalidState {
                    expected: "ready or running".to_string(),
                    actual: self.state.to_string(),
                })
            }
        }
        self.state = EmulatorState::Running;

        let fault = match self.trace.enter() {
            Ok(fault) => fault,
            Err(e) => {
                self.state = EmulatorState::Failed;
                return Err(e);
            }
        };
        self.exits += 1;
        if let Some(out) = self.regs_out.as_mut() {
            writeln!(out, "{}", fault.regs.to_csv())?;
        }

        let outcome = match self.handle(fault) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = EmulatorState::Failed;
                return Err(e);
            }
        };
        match &outcome {
            StepOutcome::Exited(code) => {
                log::info!("guest exited with code {}", code);
                self.state = EmulatorState::Exited(*code);
                self.flush_regs()?;
            }
            StepOutcome::Stopped { fault, error } => {
                match error {
                    Some(e) => log::warn!("guest stopped at pc {:#x}: {}", fault.pc_at_trap, e),
                    None => log::warn!(
                        "guest stopped on {} exit at {:#x} (pc {:#x})",
                        fault.kind,
                        fault.addr,
                        fault.pc_at_trap
                    ),
                }
                self.state = EmulatorState::Failed;
                self.flush_regs()?;
            }
            StepOutcome::Continue(_) => {}
        }
        Ok(outcome)
    }

    /// Step until the guest exits. An exit nothing can service becomes
    /// an error.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            match self.step()? {
                StepOutcome::Continue(_) => {}
                StepOutcome::Exited(code) => return Ok(code),
                StepOutcome::Stopped { error: Some(e), .. } => return Err(e),
                StepOutcome::Stopped { fault, error: None } => {
                    return Err(Error::GuestFault {
                        kind: fault.kind,
                        addr: fault.addr,
                        pc: fault.pc_at_trap,
                    })
                }
            }
        }
    }

    fn flush_regs(&mut self) -> Result<()> {
        if let Some(out) = self.regs_out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    /// Whether `fault` is the guest touching the service space, as
    /// opposed to a single-step report.
    fn is_trap(&self, fault: &Fault) -> bool {
        match fault.kind {
            ExitKind::Halt | ExitKind::Mmio => true,
            ExitKind::Debug => match (self.trace.arch(), &fault.payload) {
                (Arch::Aarch64, Payload::Debug { exception, .. }) => {
                    !ESR_EC_SOFTWARE_STEP.contains(&(exception >> 26))
                }
                (Arch::Aarch64, _) => true,
                (Arch::X86_64, _) => false,
            },
            _ => false,
        }
    }

    fn handle(&mut self, fault: Fault) -> Result<StepOutcome> {
        match fault.kind {
            ExitKind::Interrupt => return Ok(StepOutcome::Continue(fault)),
            ExitKind::Halt | ExitKind::Mmio | ExitKind::Debug => {}
            _ => return Ok(StepOutcome::Stopped { fault, error: None }),
        }

        if !self.is_trap(&fault) {
            if self.singlestep {
                return Ok(StepOutcome::Continue(fault));
            }
            return Ok(StepOutcome::Stopped { fault, error: None });
        }

        let target = fault.mmio().map_or(fault.addr, |(phys, _, _)| phys);
        if target == ENTRY_RETURN_TRAP {
            let status = fault.regs.ret();
            debug_dispatch!("entry point returned {:#x}", status);
            return Ok(StepOutcome::Exited(services::exit_code(status)));
        }

        let ptr = resolve(target);
        if !self.dispatcher.is_bound(ptr.base) {
            if fault.kind == ExitKind::Halt {
                debug_kvm!("guest halted at {:#x}", fault.addr);
                return Ok(StepOutcome::Exited(0));
            }
            return Ok(StepOutcome::Stopped { fault, error: None });
        }

        match self.dispatcher.dispatch(&mut *self.trace, &fault) {
            Ok(done) => match done.exit {
                Some(code) => Ok(StepOutcome::Exited(code)),
                None => Ok(StepOutcome::Continue(fault)),
            },
            Err(e) if e.kind() == crate::error::ErrorKind::Fatal => Err(e),
            Err(e) => Ok(StepOutcome::Stopped {
                fault,
                error: Some(e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::loader::testing::tiny_pe;
    use crate::memory::layout::TRAP_OFFSET;
    use crate::trace::testing::{FakeTrace, Script};
    use crate::uefi::table::{boot as bs, system};

    const BUMP_BASE: u64 = 0x40_0000;

    /// Shared sink for the register trace.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn options() -> BootOptions {
        BootOptions {
            bump_base: BUMP_BASE,
            bump_limit: 0x80_0000,
            handle_console_io: false,
            singlestep: false,
        }
    }

    fn boot(arch: Arch, regs_out: Option<Sink>) -> (Emulator, Script) {
        let machine = match arch {
            Arch::X86_64 => 0x8664,
            Arch::Aarch64 => 0xaa64,
        };
        let loader =
            ImageLoader::from_bytes(tiny_pe(machine, 0x10_0000, &[0xf4])).with_arch(arch);
        let trace = FakeTrace::new(arch);
        let exits = trace.exits.clone();
        let out = regs_out.map(|s| Box::new(s) as Box<dyn Write + Send>);
        let emu = Emulator::boot(Box::new(trace), &loader, &options(), out).unwrap();
        (emu, exits)
    }

    fn script(exits: &Script, kind: ExitKind, addr: u64, payload: Payload, regs: Regs) {
        exits
            .lock()
            .push_back(Fault::new(kind, addr, payload, regs));
    }

    #[test]
    fn test_boot_prepares_entry() {
        let (mut emu, _) = boot(Arch::X86_64, None);
        assert_eq!(emu.state(), EmulatorState::Ready);
        let regs = emu.trace_mut().get_regs().unwrap();
        assert_eq!(regs.pc(), 0x10_1000);
        assert_eq!(regs.register_arg(0), Some(emu.entry().image_handle));
        assert_eq!(regs.register_arg(1), Some(emu.entry().system_table));
        let ret = emu.trace().read_word(regs.sp()).unwrap();
        assert_eq!(ret, ENTRY_RETURN_TRAP);
    }

    #[test]
    fn test_entry_return_exits_with_status() {
        let (mut emu, exits) = boot(Arch::X86_64, None);
        let mut regs = emu.trace_mut().get_regs().unwrap();
        regs.set_ret(crate::uefi::status::ERROR_BIT | 3);
        regs.set_pc(ENTRY_RETURN_TRAP + 1);
        script(&exits, ExitKind::Halt, ENTRY_RETURN_TRAP, Payload::None, regs);

        assert!(matches!(emu.step().unwrap(), StepOutcome::Exited(3)));
        assert_eq!(emu.state(), EmulatorState::Exited(3));
        assert!(matches!(emu.step(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_halt_in_low_memory_is_clean_exit() {
        let (mut emu, exits) = boot(Arch::X86_64, None);
        let mut regs = emu.trace_mut().get_regs().unwrap();
        regs.set_pc(0x10_1001);
        script(&exits, ExitKind::Halt, 0x10_1000, Payload::None, regs);
        assert_eq!(emu.run().unwrap(), 0);
    }

    #[test]
    fn test_shutdown_stops_guest() {
        let (mut emu, exits) = boot(Arch::X86_64, None);
        let regs = emu.trace_mut().get_regs().unwrap();
        let payload = Payload::Shutdown { subtype: 0, flags: 0 };
        script(&exits, ExitKind::Shutdown, 0x10_1000, payload, regs);
        match emu.run() {
            Err(Error::GuestFault { kind, .. }) => assert_eq!(kind, ExitKind::Shutdown),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(emu.state(), EmulatorState::Failed);
    }

    #[test]
    fn test_exit_boot_services_from_arm64() {
        let sink = Sink::default();
        let (mut emu, exits) = boot(Arch::Aarch64, Some(sink.clone()));
        let st = emu.entry().system_table;
        let boot_services = emu.trace().read_word(st + system::BOOT_SERVICES).unwrap();

        // blr x8 at 0x1000
        emu.trace_mut().write_u32(0x1000, 0xd63f_0100).unwrap();
        let cell = boot_services + bs::EXIT_BOOT_SERVICES + TRAP_OFFSET;
        let mut regs = emu.trace_mut().get_regs().unwrap();
        regs.set_gpr(30, 0x1004);
        regs.set_pc(cell);
        let payload = Payload::Debug {
            exception: 0x3c << 26,
            pc: cell,
            info: 0,
        };
        script(&exits, ExitKind::Debug, cell, payload, regs);

        assert_eq!(emu.run().unwrap(), 0);
        assert_eq!(emu.exits(), 1);
        let csv = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.starts_with(&Regs::csv_header(Arch::Aarch64)));
    }

    #[test]
    fn test_unbound_mmio_stops_with_fault() {
        let (mut emu, exits) = boot(Arch::X86_64, None);
        let regs = emu.trace_mut().get_regs().unwrap();
        let payload = Payload::Mmio {
            phys_addr: 0xef00_0000,
            data: [0; 8],
            len: 8,
            is_write: false,
        };
        script(&exits, ExitKind::Mmio, 0xef00_0000, payload, regs);
        match emu.step().unwrap() {
            StepOutcome::Stopped { fault, error } => {
                assert_eq!(fault.addr, 0xef00_0000);
                assert!(error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
