//! The UEFI services efivm emulates.
//!
//! Each service lays out its table in the service space when it is first
//! instantiated. [`register_all`] makes them known to a [`Dispatcher`];
//! [`install`] builds the system table and the handles an application
//! expects to find at entry.

pub mod block_io;
pub mod boot;
pub mod collation;
pub mod loaded_image;
pub mod runtime;
pub mod system_table;
pub mod text_in;
pub mod text_out;

use crate::error::Result;
use crate::loader::ImageInfo;
use crate::memory::layout::ENTRY_RETURN_TRAP;
use crate::regs::Arch;
use crate::service::{Dispatcher, Registration};
use crate::trace::Trace;
use crate::uefi::guid::{BLOCK_IO, LOADED_IMAGE, SIMPLE_TEXT_INPUT, SIMPLE_TEXT_OUTPUT};
use crate::uefi::status::ERROR_BIT;
use crate::uefi::table::{loaded_image as li, system};
use crate::uefi::POINTER_SIZE;

/// Every service efivm provides, in the order they are laid out.
pub fn registrations() -> [Registration; 8] {
    [
        loaded_image::REGISTRATION,
        system_table::REGISTRATION,
        text_out::REGISTRATION,
        text_in::REGISTRATION,
        runtime::REGISTRATION,
        boot::REGISTRATION,
        collation::REGISTRATION,
        block_io::REGISTRATION,
    ]
}

/// Register every service with `dispatcher`.
pub fn register_all(dispatcher: &mut Dispatcher) -> Result<()> {
    for reg in registrations() {
        dispatcher.register(reg)?;
    }
    Ok(())
}

/// Handles and tables handed to the entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub image_handle: u64,
    pub system_table: u64,
}

/// Lay out the system table, the services it points at and the standard
/// handles for `image`.
pub fn install(dispatcher: &mut Dispatcher, trace: &mut dyn Trace, image: &ImageInfo) -> Result<Entry> {
    dispatcher.set_image(image.clone());

    let loaded_image = dispatcher.instantiate(trace, loaded_image::NAME)?;
    let st = dispatcher.instantiate(trace, system_table::NAME)?;
    for (name, offset) in [
        (text_out::NAME, system::CON_OUT),
        (text_in::NAME, system::CON_IN),
        (runtime::NAME, system::RUNTIME_SERVICES),
        (boot::NAME, system::BOOT_SERVICES),
    ] {
        let base = dispatcher.instantiate(trace, name)?;
        trace.write_word(st + offset, base)?;
    }
    let con_out = trace.read_word(st + system::CON_OUT)?;
    trace.write_word(st + system::STD_ERR, con_out)?;
    dispatcher.instantiate(trace, collation::NAME)?;
    dispatcher.instantiate(trace, block_io::NAME)?;

    trace.write_word(loaded_image + li::SYSTEM_TABLE, st)?;
    // The image was loaded from the block device.
    if let Some(&device) = dispatcher.handles().all_handles_by_guid(&BLOCK_IO).first() {
        trace.write_word(loaded_image + li::DEVICE_HANDLE, device)?;
    }

    let image_handle = dispatcher.handles_mut().create();
    dispatcher
        .handles_mut()
        .put(image_handle, LOADED_IMAGE, &[], loaded_image)?;

    for (guid, offset) in [
        (SIMPLE_TEXT_INPUT, system::CON_IN_HANDLE),
        (SIMPLE_TEXT_OUTPUT, system::CON_OUT_HANDLE),
        (SIMPLE_TEXT_OUTPUT, system::STD_ERR_HANDLE),
    ] {
        let handle = dispatcher.handles_mut().create();
        dispatcher.install_protocol(trace, handle, &guid)?;
        trace.write_word(st + offset, handle)?;
    }

    system_table::seal(trace, st)?;
    log::info!(
        "system table at {:#x}, image handle {:#x}",
        st,
        image_handle
    );
    Ok(Entry {
        image_handle,
        system_table: st,
    })
}

/// Point the vCPU at the image entry with `entry`'s arguments, returning
/// into [`ENTRY_RETURN_TRAP`].
pub fn prepare_entry(trace: &mut dyn Trace, image: &ImageInfo, entry: &Entry) -> Result<()> {
    let mut regs = trace.get_regs()?;
    regs.set_pc(image.entry);
    regs.set_register_arg(0, entry.image_handle);
    regs.set_register_arg(1, entry.system_table);
    match regs.arch() {
        Arch::X86_64 => {
            // Home space for the four register arguments sits above the
            // return address.
            regs.set_sp((image.stack_top & !0xf) - 4 * POINTER_SIZE);
            trace.push(&mut regs, ENTRY_RETURN_TRAP)?;
        }
        Arch::Aarch64 => {
            regs.set_sp(image.stack_top & !0xf);
            regs.set_gpr(crate::regs::ARM64_LR, ENTRY_RETURN_TRAP);
        }
    }
    trace.set_regs(&regs)
}

/// Process exit code for an `EFI_STATUS` the guest handed back.
pub fn exit_code(status: u64) -> i32 {
    match status & !ERROR_BIT {
        0 => 0,
        c => c.min(255) as i32,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A fake guest with every service registered.

    use crate::fault::{ExitKind, Fault, Payload};
    use crate::loader::{ImageFormat, ImageInfo};
    use crate::memory::layout::TRAP_OFFSET;
    use crate::regs::Arch;
    use crate::service::{Dispatched, Dispatcher, ServiceOptions, ServiceSpace};
    use crate::trace::testing::FakeTrace;
    use crate::trace::Trace;

    pub const BUMP_BASE: u64 = 0x40_0000;

    pub fn image() -> ImageInfo {
        ImageInfo {
            format: ImageFormat::Pe,
            entry: 0x10_1000,
            image_base: 0x10_0000,
            image_size: 0x3000,
            heap_base: 0x10_3000,
            stack_top: 0x20_0000,
        }
    }

    pub fn setup(arch: Arch) -> (FakeTrace, Dispatcher) {
        let mut trace = FakeTrace::new(arch);
        let mut d = Dispatcher::new(
            ServiceSpace::new(arch, BUMP_BASE, 0x80_0000),
            ServiceOptions::default(),
        );
        d.space().poison(trace.memory_mut()).unwrap();
        super::register_all(&mut d).unwrap();
        (trace, d)
    }

    /// Call slot `offset` of the service at `base` from an arm64 guest,
    /// `blr x8` at 0x1000 with `args` in x0 onwards.
    pub fn call(
        t: &mut FakeTrace,
        d: &mut Dispatcher,
        base: u64,
        offset: u64,
        args: &[u64],
    ) -> Dispatched {
        t.write_u32(0x1000, 0xd63f_0100).unwrap();
        let mut regs = t.get_regs().unwrap();
        for (i, a) in args.iter().enumerate() {
            regs.set_register_arg(i, *a);
        }
        regs.set_gpr(30, 0x1004);
        let cell = base + offset + TRAP_OFFSET;
        regs.set_pc(cell);
        let fault = Fault::new(ExitKind::Debug, cell, Payload::None, regs);
        d.dispatch(t, &fault).unwrap()
    }
}
