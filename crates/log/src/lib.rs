//! # Lowtide Log
//!
//! Structured logging setup shared by lowtide binaries and tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! // Pick a preset from the environment
//! let _guard = lowtide_log::auto_init()?;
//! tracing::info!(pressure = 72.5, "memory warning");
//! # Ok::<(), lowtide_log::LogError>(())
//! ```
//!
//! ## Environment
//!
//! - `LOWTIDE_LOG` (falls back to `RUST_LOG`): filter directives
//! - `LOWTIDE_LOG_FORMAT`: `pretty`, `compact` or `json`
//! - `LOWTIDE_SERVICE`: service name attached to the root span

#![deny(missing_docs)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Fields, Format};
pub use error::{LogError, LogResult};

/// Initialize with sensible defaults (compact, info)
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init() -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(Config::default()).build()
}

/// Initialize with a specific configuration
///
/// # Errors
///
/// Returns error if the filter is invalid or a subscriber is already installed.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize from the environment, preferring the development preset in
/// debug builds when nothing is configured.
///
/// # Errors
///
/// Returns error if the filter is invalid or a subscriber is already installed.
pub fn auto_init() -> LogResult<LoggerGuard> {
    let configured = std::env::var_os("LOWTIDE_LOG").is_some()
        || std::env::var_os("RUST_LOG").is_some()
        || std::env::var_os("LOWTIDE_LOG_FORMAT").is_some();

    let config = if configured {
        Config::from_env()
    } else if cfg!(debug_assertions) {
        Config::development()
    } else {
        Config::production()
    };
    init_with(config)
}
