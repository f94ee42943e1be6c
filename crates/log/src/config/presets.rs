//! Configuration presets for common scenarios

use super::{Config, DisplayConfig, Format};

impl Config {
    /// Create configuration from environment variables
    ///
    /// Reads `LOWTIDE_LOG` (falling back to `RUST_LOG`) for the filter and
    /// `LOWTIDE_LOG_FORMAT` for the output format.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("LOWTIDE_LOG").or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }

        if let Some(format) = lookup("LOWTIDE_LOG_FORMAT") {
            config.format = Format::parse_lossy(&format);
            if config.format == Format::Json {
                config.display.colors = false;
            }
        }

        if let Some(service) = lookup("LOWTIDE_SERVICE") {
            config.fields.service = Some(service);
        }

        config
    }

    /// Development configuration (pretty, debug level)
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            display: DisplayConfig {
                colors: true,
                source: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level)
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            display: DisplayConfig {
                colors: false,
                source: false,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Test configuration (trace level, no colors)
    #[must_use]
    pub fn test() -> Self {
        Self {
            level: "trace".to_string(),
            format: Format::Compact,
            display: DisplayConfig {
                colors: false,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn lowtide_log_wins_over_rust_log() {
        let config = Config::from_lookup(lookup(&[
            ("LOWTIDE_LOG", "debug"),
            ("RUST_LOG", "warn"),
        ]));
        assert_eq!(config.level, "debug");
    }

    #[test]
    fn rust_log_is_the_fallback() {
        let config = Config::from_lookup(lookup(&[("RUST_LOG", "warn")]));
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn json_format_disables_colors() {
        let config = Config::from_lookup(lookup(&[("LOWTIDE_LOG_FORMAT", "JSON")]));
        assert_eq!(config.format, Format::Json);
        assert!(!config.display.colors);
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
    }

    #[test]
    fn production_is_json_info() {
        let config = Config::production();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, Format::Json);
    }
}
