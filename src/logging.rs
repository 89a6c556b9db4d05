//! Tracing initialisation.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the configured
//! log level. Output is human-readable or JSON lines.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Build the filter for `config`, preferring `RUST_LOG`.
pub fn env_filter(config: &ApplicationConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), config.log_level))
    })
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_from_config(config: &ApplicationConfig) {
    let filter = env_filter(config);
    let installed = if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if installed.is_ok() {
        tracing::debug!(app = %config.name, format = %config.log_format, "Logging initialised");
    }
}

