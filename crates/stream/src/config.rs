//! Window shapes and limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lowtide_core::{Error, Result};

/// How the stream is cut into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WindowMode {
    /// Back-to-back windows of `size` items
    Tumbling {
        /// Items per window
        size: usize,
    },
    /// Windows of `size` items starting every `slide` items
    Sliding {
        /// Items per window
        size: usize,
        /// Items between window starts
        slide: usize,
    },
    /// The items of the trailing `duration`, re-cut on every insert
    Time {
        /// Trailing span
        #[serde(with = "lowtide_core::serde_ms")]
        duration: Duration,
    },
    /// Items separated by gaps no longer than `timeout`
    Session {
        /// Gap that closes a session
        #[serde(with = "lowtide_core::serde_ms")]
        timeout: Duration,
    },
}

/// Configuration for [`WindowedAggregator`](crate::WindowedAggregator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window shape
    pub mode: WindowMode,
    /// Closed windows kept; the oldest go first. Default: 100
    #[serde(default = "default_max_windows")]
    pub max_windows: usize,
}

const fn default_max_windows() -> usize {
    100
}

impl WindowConfig {
    /// Non-overlapping windows of `size` items.
    pub const fn tumbling(size: usize) -> Self {
        Self::with_mode(WindowMode::Tumbling { size })
    }

    /// Windows of `size` items starting every `slide` items.
    pub const fn sliding(size: usize, slide: usize) -> Self {
        Self::with_mode(WindowMode::Sliding { size, slide })
    }

    /// The trailing `duration` of items.
    pub const fn time(duration: Duration) -> Self {
        Self::with_mode(WindowMode::Time { duration })
    }

    /// Sessions closed by a gap longer than `timeout`.
    pub const fn session(timeout: Duration) -> Self {
        Self::with_mode(WindowMode::Session { timeout })
    }

    const fn with_mode(mode: WindowMode) -> Self {
        Self {
            mode,
            max_windows: default_max_windows(),
        }
    }

    /// Keep at most `max_windows` closed windows.
    #[must_use]
    pub const fn with_max_windows(mut self, max_windows: usize) -> Self {
        self.max_windows = max_windows;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_windows == 0 {
            return Err(Error::configuration("max_windows must be > 0"));
        }
        match self.mode {
            WindowMode::Tumbling { size } if size == 0 => {
                Err(Error::configuration("window size must be > 0"))
            }
            WindowMode::Sliding { size, slide } if size == 0 || slide == 0 || slide > size => {
                Err(Error::configuration(
                    "sliding windows need 0 < slide <= size",
                ))
            }
            WindowMode::Time { duration } if duration.is_zero() => {
                Err(Error::configuration("window duration must be greater than zero"))
            }
            WindowMode::Session { timeout } if timeout.is_zero() => {
                Err(Error::configuration("session timeout must be greater than zero"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slide_larger_than_window_is_rejected() {
        assert!(WindowConfig::sliding(3, 4).validate().is_err());
        assert!(WindowConfig::sliding(3, 0).validate().is_err());
        assert!(WindowConfig::sliding(3, 1).validate().is_ok());
        assert!(WindowConfig::tumbling(1).with_max_windows(0).validate().is_err());
    }

    #[test]
    fn mode_is_tagged_in_json() {
        let config: WindowConfig =
            serde_json::from_str(r#"{"mode": {"type": "session", "timeout": 30000}}"#).unwrap();
        assert_eq!(config, WindowConfig::session(Duration::from_secs(30)));
    }
}
