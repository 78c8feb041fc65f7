//! Builder for configuring and creating an [`Emulator`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::backend::{self, VmConfig};
use crate::error::{Error, Result};
use crate::loader::ImageLoader;
use crate::memory::layout::{DEFAULT_BUMP_BASE, DEFAULT_LOW_RAM_SIZE};
use crate::vm::{BootOptions, Emulator};

/// Builder for creating an [`Emulator`].
///
/// # Example
///
/// ```rust,no_run
/// use efivm::Emulator;
///
/// let emu = Emulator::builder()
///     .image("/path/to/app.efi")
///     .device("/dev/kvm")
///     .bump_base(0x4000_0000)
///     .regs_output("regs.csv")
///     .build()?;
/// # Ok::<(), efivm::Error>(())
/// ```
#[derive(Debug, Default, Clone)]
pub struct EmulatorBuilder {
    image: Option<PathBuf>,
    device: Option<PathBuf>,
    low_ram_size: Option<u64>,
    bump_base: Option<u64>,
    handle_console_io: bool,
    singlestep: bool,
    regs_output: Option<PathBuf>,
}

impl EmulatorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the EFI application to run (PE32+ or ELF64).
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }

    /// Set the KVM device node.
    ///
    /// Default: `/dev/kvm`
    pub fn device(mut self, path: impl Into<PathBuf>) -> Self {
        self.device = Some(path.into());
        self
    }

    /// Set the size of RAM mapped at guest physical 0.
    ///
    /// Default: 2 GiB
    pub fn low_ram_size(mut self, bytes: u64) -> Self {
        self.low_ram_size = Some(bytes);
        self
    }

    /// Set where AllocatePool and AllocatePages start carving memory.
    ///
    /// Default: 0x4000_0000
    pub fn bump_base(mut self, addr: u64) -> Self {
        self.bump_base = Some(addr);
        self
    }

    /// Feed host stdin to the Simple Text Input protocol.
    ///
    /// Default: off (ReadKeyStroke reports NotReady)
    pub fn handle_console_io(mut self, on: bool) -> Self {
        self.handle_console_io = on;
        self
    }

    /// Trap after every guest instruction.
    ///
    /// Default: off
    pub fn singlestep(mut self, on: bool) -> Self {
        self.singlestep = on;
        self
    }

    /// Write a CSV register trace, one row per VM exit, to `path`.
    pub fn regs_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.regs_output = Some(path.into());
        self
    }

    /// The backend configuration this builder describes.
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            device: self
                .device
                .clone()
                .unwrap_or_else(|| PathBuf::from(backend::DEFAULT_DEVICE)),
            low_ram_size: self.low_ram_size.unwrap_or(DEFAULT_LOW_RAM_SIZE),
        }
    }

    /// Validate the settings that do not need a hypervisor.
    pub fn validate(&self) -> Result<(VmConfig, BootOptions)> {
        let config = self.vm_config();
        config.validate()?;

        let bump_base = self.bump_base.unwrap_or(DEFAULT_BUMP_BASE);
        if bump_base >= config.low_ram_size {
            return Err(Error::InvalidGuestAddress(bump_base));
        }

        if let Some(ref image) = self.image {
            if !image.exists() {
                return Err(Error::ImageNotFound(image.clone()));
            }
        }

        let options = BootOptions {
            bump_base,
            bump_limit: config.low_ram_size,
            handle_console_io: self.handle_console_io,
            singlestep: self.singlestep,
        };
        Ok((config, options))
    }

    /// Build the emulator.
    ///
    /// This validates the configuration, creates the VM on the platform
    /// backend, loads the image and installs the UEFI services.
    pub fn build(self) -> Result<Emulator> {
        let (config, options) = self.validate()?;
        let image = self
            .image
            .clone()
            .ok_or_else(|| Error::InvalidImage("no image given".into()))?;

        let trace = backend::create(&config)?;
        let loader = ImageLoader::new(&image)?.with_arch(trace.arch());

        let regs_out = match self.regs_output {
            Some(path) => {
                Some(Box::new(BufWriter::new(File::create(path)?)) as Box<dyn Write + Send>)
            }
            None => None,
        };

        Emulator::boot(trace, &loader, &options, regs_out)
    }
}
