//! efivm CLI tool
//!
//! Runs one EFI application on KVM and exits with the guest's code.

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::Parser;

use efivm::debug::init_logging;
use efivm::Emulator;

#[derive(Debug, Parser)]
#[command(name = "efivm", version, about = "Run an EFI application on KVM")]
struct Cli {
    /// EFI application to run (PE32+ or ELF64)
    #[arg(value_name = "IMAGE", required_unless_present = "info")]
    image: Option<PathBuf>,

    /// KVM device node
    #[arg(long, value_name = "PATH", default_value = efivm::backend::DEFAULT_DEVICE)]
    kvmdevice: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Feed host stdin to the guest's console input
    #[arg(long)]
    handle_console_io: bool,

    /// Base address for guest pool and page allocations
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    bump: Option<u64>,

    /// Trap after every guest instruction
    #[arg(long)]
    singlestep: bool,

    /// Write a CSV register trace, one row per VM exit
    #[arg(long, value_name = "FILE")]
    regs: Option<PathBuf>,

    /// Show hypervisor information and exit
    #[arg(long)]
    info: bool,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    if cli.info {
        print_info();
        return Ok(0);
    }

    let Some(image) = cli.image else {
        bail!("no image given");
    };

    let mut builder = Emulator::builder()
        .image(&image)
        .device(&cli.kvmdevice)
        .handle_console_io(cli.handle_console_io)
        .singlestep(cli.singlestep);
    if let Some(addr) = cli.bump {
        builder = builder.bump_base(addr);
    }
    if let Some(path) = cli.regs {
        builder = builder.regs_output(path);
    }

    let mut emu = builder
        .build()
        .with_context(|| format!("failed to start {}", image.display()))?;
    log::info!(
        "{}: entry at {:#x}, system table at {:#x}",
        image.display(),
        emu.image().entry,
        emu.entry().system_table
    );

    let code = emu
        .run()
        .with_context(|| format!("{} stopped", image.display()))?;
    log::info!("guest exited with {}", code);
    Ok(code)
}

fn print_info() {
    println!("Hypervisor Information");
    println!("======================");

    if efivm::is_supported() {
        println!("Status: Available");
        if let Some(name) = efivm::backend_name() {
            println!("Backend: {}", name);
        }
    } else {
        println!("Status: Not available");
        println!("Note: /dev/kvm is missing or not accessible.");
    }

    #[cfg(target_arch = "aarch64")]
    println!("Architecture: ARM64 (aarch64)");
    #[cfg(target_arch = "x86_64")]
    println!("Architecture: x86-64");
}
