//! Debug logging utilities for efivm.
//!
//! Set the `EFIVM_DEBUG` environment variable to enable verbose logging:
//! - `EFIVM_DEBUG=1` - Enable all debug output
//! - `EFIVM_DEBUG=kvm` - Enable only KVM exit and ioctl logs
//! - `EFIVM_DEBUG=dispatch` - Enable only fault dispatch logs
//! - `EFIVM_DEBUG=service` - Enable only UEFI service logs
//! - `EFIVM_DEBUG=kvm,service` - Enable multiple categories
//!
//! Output goes through the `log` facade, so a logger has to be installed
//! (see [`init_logging`]) and must let `debug` records through.

use std::sync::{Once, OnceLock};

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Kvm,
    Dispatch,
    Service,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

static LOGGER: Once = Once::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    kvm: bool,
    dispatch: bool,
    service: bool,
}

impl DebugConfig {
    fn parse(val: &str) -> Self {
        let val_lower = val.to_lowercase();
        if val_lower == "1" || val_lower == "all" {
            return Self {
                enabled: true,
                kvm: true,
                dispatch: true,
                service: true,
            };
        }
        Self {
            enabled: true,
            kvm: val_lower.contains("kvm"),
            dispatch: val_lower.contains("dispatch"),
            service: val_lower.contains("service"),
        }
    }

    fn from_env() -> Self {
        match std::env::var("EFIVM_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    if !config.enabled {
        return false;
    }
    match category {
        DebugCategory::All => config.kvm || config.dispatch || config.service,
        DebugCategory::Kvm => config.kvm,
        DebugCategory::Dispatch => config.dispatch,
        DebugCategory::Service => config.service,
    }
}

/// Install the process logger.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `info`, raised to
/// `debug` when `verbose` is true or any `EFIVM_DEBUG` category is on.
/// Calling this more than once is harmless.
pub fn init_logging(verbose: bool) {
    LOGGER.call_once(|| {
        let default = if verbose || is_debug_enabled(DebugCategory::All) {
            "debug"
        } else {
            "info"
        };
        let env = env_logger::Env::default().default_filter_or(default);
        // A logger may already be installed by an embedding program or test.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp(None)
            .try_init();
    });
}

/// Debug log macro for KVM-related messages
#[macro_export]
macro_rules! debug_kvm {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Kvm) {
            log::debug!(target: "efivm::kvm", $($arg)*);
        }
    };
}

/// Debug log macro for fault dispatch
#[macro_export]
macro_rules! debug_dispatch {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Dispatch) {
            log::debug!(target: "efivm::dispatch", $($arg)*);
        }
    };
}

/// Debug log macro for UEFI services
#[macro_export]
macro_rules! debug_service {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Service) {
            log::debug!(target: "efivm::service", $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_categories() {
        let c = DebugConfig::parse("kvm,Service");
        assert!(c.enabled && c.kvm && c.service);
        assert!(!c.dispatch);

        let all = DebugConfig::parse("ALL");
        assert!(all.kvm && all.dispatch && all.service);
    }
}
