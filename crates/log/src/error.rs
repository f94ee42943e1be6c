//! Error types for logger setup

use thiserror::Error;

/// Result type for logging operations
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while installing the global subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The level/filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed
    #[error("failed to initialise logger: {0}")]
    Init(String),
}
