//! Logging setup
//!
//! Installs a `tracing` subscriber. `RUST_LOG` takes precedence over the
//! configured level so individual modules can be turned up from the shell,
//! e.g. `RUST_LOG=op_video::surface_cache=trace`.

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::DebugConfig;
use crate::error::EmulatorError;

/// Build the filter for the given configuration
pub fn env_filter(config: &DebugConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
}

/// Initialize the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_logging(config: &DebugConfig) -> Result<bool, EmulatorError> {
    let filter = env_filter(config);

    let installed = if config.log_to_file {
        let file = File::create(&config.log_path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!("Logging initialized at level {:?}", config.log_level);
    }
    Ok(installed)
}
