//! # Lowtide
//!
//! Adaptive offline resource manager for mobile and desktop hosts.
//!
//! The host feeds platform signals (memory readings, battery state, network
//! conditions, foreground/background transitions) and supplies a few
//! collaborators; lowtide adapts memory use, power profile, sync cadence and
//! cache behaviour to them.
//!
//! ## Key Components
//!
//! - [`AdaptiveManager`]: owns the memory monitor, resource pool, power
//!   controller and sync scheduler, and bridges pressure events to garbage
//!   collection
//! - [`ManagerConfig`]: every controller's configuration in one JSON document
//! - [`EventStats`]: counts controller events by signal name, and mirrors
//!   them into the `metrics` facade when the `metrics` feature is enabled
//! - Re-exported controller crates: [`core`], [`memory`], [`power`], [`sync`],
//!   [`cache`], [`stream`], [`log`]
//!
//! ## Usage
//!
//! ```rust
//! use lowtide::prelude::*;
//!
//! let config = ManagerConfig::from_json_str(r#"{
//!     "pool": { "gc_threshold": 85.0 },
//!     "windows": { "mode": { "type": "tumbling", "size": 5 } }
//! }"#)?;
//! assert_eq!(config.pool.gc_threshold, 85.0);
//! assert_eq!(config.windows, WindowConfig::tumbling(5));
//! # Ok::<(), lowtide::core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod manager;
pub mod stats;

pub use config::ManagerConfig;
pub use manager::{AdaptiveManager, HostBindings};
pub use stats::EventStats;

pub use lowtide_cache as cache;
pub use lowtide_core as core;
pub use lowtide_log as log;
pub use lowtide_memory as memory;
pub use lowtide_power as power;
pub use lowtide_stream as stream;
pub use lowtide_sync as sync;

/// Common imports for host integrations.
pub mod prelude {
    pub use crate::{AdaptiveManager, EventStats, HostBindings, ManagerConfig};

    pub use lowtide_cache::{
        ItemKind, LazyResourceLoader, LoadableItem, PageData, PageLoader, PaginatedCache,
        PrefetchGate, UrlFetcher,
    };
    pub use lowtide_core::{
        AppState, BatterySource, BatteryStatus, Error, NetworkConditions, NetworkSource, Result,
        Signal,
    };
    pub use lowtide_memory::{ManagedResource, MemoryReading, MemorySource, ResourceKind};
    pub use lowtide_power::{ProfileKind, TaskConstraints};
    pub use lowtide_stream::{WindowConfig, WindowedAggregator};
    pub use lowtide_sync::{Chunk, ChunkTransport, SyncDirection, SyncTask, WakeLock};
}
