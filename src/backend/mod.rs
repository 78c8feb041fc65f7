//! Hypervisor backend selection.
//!
//! A backend turns a [`VmConfig`] into a [`Trace`]: a running VM with
//! guest memory laid out per [`crate::memory::layout`] and one vCPU
//! ready to enter 64-bit code. KVM on Linux is the only backend.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::memory::layout::{DEFAULT_LOW_RAM_SIZE, SERVICE_TABLE_BASE};
use crate::trace::Trace;

#[cfg(target_os = "linux")]
pub mod kvm;

/// Default KVM device node.
pub const DEFAULT_DEVICE: &str = "/dev/kvm";

/// Configuration for creating a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Hypervisor device node.
    pub device: PathBuf,
    /// Bytes of RAM mapped at guest physical 0.
    pub low_ram_size: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            low_ram_size: DEFAULT_LOW_RAM_SIZE,
        }
    }
}

impl VmConfig {
    /// Low RAM must be whole pages and stay clear of the service space.
    pub fn validate(&self) -> Result<()> {
        if self.low_ram_size == 0
            || self.low_ram_size % 0x1000 != 0
            || self.low_ram_size > SERVICE_TABLE_BASE
        {
            return Err(Error::InvalidMemorySize(self.low_ram_size));
        }
        Ok(())
    }
}

/// Check if the hypervisor is available on this platform.
pub fn is_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        kvm::is_available()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Get the name of the backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(target_os = "linux")]
    {
        Some("kvm")
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Create the platform backend.
pub fn create(config: &VmConfig) -> Result<Box<dyn Trace>> {
    #[cfg(target_os = "linux")]
    {
        kvm::KvmTrace::new(config).map(|t| Box::new(t) as Box<dyn Trace>)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(Error::HypervisorNotAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VmConfig::default();
        assert_eq!(config.device, PathBuf::from("/dev/kvm"));
        assert_eq!(config.low_ram_size, 0x8000_0000);
        config.validate().unwrap();
    }

    #[test]
    fn test_low_ram_limits() {
        for size in [0, 0x1234, SERVICE_TABLE_BASE + 0x1000] {
            let config = VmConfig {
                low_ram_size: size,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidMemorySize(_))));
        }
    }

    #[test]
    fn test_missing_device() {
        let config = VmConfig {
            device: PathBuf::from("/nonexistent/kvm"),
            ..Default::default()
        };
        #[cfg(target_os = "linux")]
        assert!(matches!(create(&config), Err(Error::OpenDevice { .. })));
        #[cfg(not(target_os = "linux"))]
        assert!(matches!(create(&config), Err(Error::HypervisorNotAvailable)));
    }
}
