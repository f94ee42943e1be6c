//! Aggregate configuration for [`AdaptiveManager`](crate::AdaptiveManager).

use serde::{Deserialize, Serialize};

use lowtide_cache::{LoaderConfig, PageCacheConfig};
use lowtide_core::{Error, Result};
use lowtide_memory::{MonitorConfig, PoolConfig};
use lowtide_power::PowerConfig;
use lowtide_stream::WindowConfig;
use lowtide_sync::SyncPolicy;

/// Every controller's configuration in one document.
///
/// Sections that are missing from JSON fall back to their defaults, so
/// `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Memory pressure monitor
    pub memory: MonitorConfig,
    /// Resource pool
    pub pool: PoolConfig,
    /// Power profile controller
    pub power: PowerConfig,
    /// Network sync scheduler
    pub sync: SyncPolicy,
    /// Defaults for caches built with
    /// [`AdaptiveManager::paginated_cache`](crate::AdaptiveManager::paginated_cache)
    pub pages: PageCacheConfig,
    /// Defaults for loaders built with
    /// [`AdaptiveManager::lazy_loader`](crate::AdaptiveManager::lazy_loader)
    pub loader: LoaderConfig,
    /// Defaults for aggregators built with
    /// [`AdaptiveManager::aggregator`](crate::AdaptiveManager::aggregator)
    pub windows: WindowConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            memory: MonitorConfig::default(),
            pool: PoolConfig::default(),
            power: PowerConfig::default(),
            sync: SyncPolicy::default(),
            pages: PageCacheConfig::default(),
            loader: LoaderConfig::default(),
            windows: WindowConfig::tumbling(10),
        }
    }
}

impl ManagerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid manager config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.pool.validate()?;
        self.power.validate()?;
        self.sync.validate()?;
        self.pages.validate()?;
        self.loader.validate()?;
        self.windows.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(ManagerConfig::from_json_str("{}").unwrap(), ManagerConfig::default());
    }

    #[test]
    fn sections_override_independently() {
        let config = ManagerConfig::from_json_str(
            r#"{
                "pool": { "gc_threshold": 90.0, "gc_target": 70.0 },
                "power": { "poll_interval": 30000 },
                "windows": { "mode": { "type": "sliding", "size": 6, "slide": 2 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool.gc_threshold, 90.0);
        assert_eq!(config.pool.max_pool_size, PoolConfig::default().max_pool_size);
        assert_eq!(config.power.poll_interval, Duration::from_secs(30));
        assert_eq!(config.windows, WindowConfig::sliding(6, 2));
    }

    #[test]
    fn invalid_sections_are_rejected() {
        let err = ManagerConfig::from_json_str(r#"{ "pool": { "gc_target": 95.0 } }"#).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = ManagerConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
