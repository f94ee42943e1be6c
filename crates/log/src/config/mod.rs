//! Subscriber settings

mod presets;

use serde::{Deserialize, Serialize};

/// How the global subscriber filters and renders events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `EnvFilter` directives, e.g. `info` or `debug,lowtide_cache=trace`
    pub level: String,

    /// Line layout
    pub format: Format,

    /// What each line shows besides the message
    pub display: DisplayConfig,

    /// Fields recorded on the root span
    pub fields: Fields,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            display: DisplayConfig::default(),
            fields: Fields::default(),
        }
    }
}

/// Line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Multi-line, for reading during development
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl Format {
    /// Parse a format name, falling back to compact.
    #[must_use]
    pub fn parse_lossy(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Per-line decorations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// `file:line` of the call site
    pub source: bool,
    /// Module path of the call site
    pub target: bool,
    /// Emitting thread id
    pub thread_ids: bool,
    /// ANSI colouring
    pub colors: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            source: false,
            target: true,
            thread_ids: false,
            colors: true,
        }
    }
}

/// Identity fields for every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields {
    /// Host application name
    pub service: Option<String>,
    /// Deployment channel, e.g. `beta`
    pub env: Option<String>,
}

impl Fields {
    /// Whether neither field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.env.is_none()
    }
}
