//! Error types shared by every lowtide controller
use thiserror::Error;

/// Result type for lowtide operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used for propagation decisions.
///
/// Transient failures are retried, resource exhaustion triggers eviction,
/// constraint violations fail fast at the call site and partial failures are
/// aggregated into counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network or storage failure that may succeed on retry
    Transient,
    /// Memory or capacity exhaustion
    ResourceExhaustion,
    /// Invalid input or misuse of the API
    ConstraintViolation,
    /// One member of a fan-out failed while the others proceeded
    PartialFailure,
    /// The owning component was torn down
    Cancelled,
}

/// Comprehensive error type for lowtide operations.
///
/// Payloads are plain strings so the error is `Clone`: a shared in-flight
/// load hands the same failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument failed validation
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The offending argument
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A configuration struct is inconsistent
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// A profile name did not match any known profile
    #[error("Unknown profile '{name}'")]
    UnknownProfile {
        /// The name that was looked up
        name: String,
    },

    /// An operation was invoked while its feature is switched off
    #[error("Feature '{feature}' is disabled")]
    FeatureDisabled {
        /// The disabled feature
        feature: String,
    },

    /// A fetch or storage call failed
    #[error("Transient failure during {operation}: {reason}")]
    Transient {
        /// The operation that failed
        operation: String,
        /// The failure reason
        reason: String,
    },

    /// A load exhausted its retries
    #[error("Load of '{key}' failed after {attempts} attempt(s): {reason}")]
    LoadFailed {
        /// The item or page key
        key: String,
        /// Attempts made before giving up
        attempts: u32,
        /// The last failure reason
        reason: String,
    },

    /// A chunked transfer stopped before completion
    #[error("Transfer of '{task_id}' stopped at {transferred}/{total} bytes: {reason}")]
    Transfer {
        /// The sync task identifier
        task_id: String,
        /// Bytes transferred so far
        transferred: u64,
        /// Total bytes of the task
        total: u64,
        /// Why the transfer stopped
        reason: String,
    },

    /// A resource or cleanup callback failed to release its resources
    #[error("Cleanup failed for '{resource_id}': {reason}")]
    Cleanup {
        /// The resource or callback identifier
        resource_id: String,
        /// The failure reason
        reason: String,
    },

    /// A platform sample could not be taken
    #[error("Sampling failed for {source_name}: {reason}")]
    Sampling {
        /// The signal source
        source_name: String,
        /// The failure reason
        reason: String,
    },

    /// The owning component was shut down while the operation was pending
    #[error("{component} was shut down")]
    Cancelled {
        /// The component that was torn down
        component: String,
    },
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unknown-profile error
    pub fn unknown_profile(name: impl Into<String>) -> Self {
        Self::UnknownProfile { name: name.into() }
    }

    /// Create a feature-disabled error
    pub fn feature_disabled(feature: impl Into<String>) -> Self {
        Self::FeatureDisabled {
            feature: feature.into(),
        }
    }

    /// Create a transient error
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a load-failed error
    pub fn load_failed(key: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            key: key.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Create a cleanup error
    pub fn cleanup(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cleanup {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a sampling error
    pub fn sampling(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Sampling {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(component: impl Into<String>) -> Self {
        Self::Cancelled {
            component: component.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. }
            | Self::Configuration { .. }
            | Self::UnknownProfile { .. }
            | Self::FeatureDisabled { .. } => ErrorKind::ConstraintViolation,
            Self::Transient { .. } | Self::LoadFailed { .. } | Self::Transfer { .. } => {
                ErrorKind::Transient
            }
            Self::Sampling { .. } => ErrorKind::ResourceExhaustion,
            Self::Cleanup { .. } => ErrorKind::PartialFailure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Transfer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_is_constraint_violation() {
        let err = Error::invalid_argument("page", "must be >= 1");
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid argument 'page': must be >= 1");
    }

    #[test]
    fn transient_errors_are_retryable() {
        let err = Error::transient("fetch page 3", "connection reset");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn exhausted_load_is_not_retryable() {
        let err = Error::load_failed("avatar", 3, "404");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn errors_clone_equal() {
        let err = Error::cleanup("db", "socket already closed");
        assert_eq!(err.clone(), err);
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
    }
}
