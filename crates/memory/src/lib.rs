//! # Lowtide Memory
//!
//! Memory pressure monitoring and resource ownership.
//!
//! - [`MemoryPressureMonitor`] samples a [`MemorySource`], classifies each
//!   sample against warning/critical/oom thresholds, runs leak heuristics and
//!   fans out to registered cleanup callbacks.
//! - [`ResourcePool`] owns registered resources, collects inactive ones by
//!   priority when pressure is high and keeps bounded auxiliary object pools.
//! - [`ConnectionPool`] reuses one live connection per endpoint with LRU
//!   eviction.
//!
//! ```rust
//! use std::sync::Arc;
//! use lowtide_memory::{
//!     ManagedResource, MemoryPressureMonitor, MemoryReading, MemorySource, MonitorConfig,
//!     PoolConfig, ResourceKind, ResourcePool,
//! };
//!
//! struct Fixed;
//! impl MemorySource for Fixed {
//!     fn read(&self) -> lowtide_core::Result<MemoryReading> {
//!         Ok(MemoryReading::new(42, 100))
//!     }
//! }
//!
//! let monitor = Arc::new(MemoryPressureMonitor::new(MonitorConfig::default(), Arc::new(Fixed))?);
//! let pool = ResourcePool::new(PoolConfig::default(), monitor.clone())?;
//! pool.register(ManagedResource::new("thumbs", ResourceKind::Cache, 4096))?;
//! assert_eq!(monitor.sample().map(|s| s.percent_used), Some(42.0));
//! # Ok::<(), lowtide_core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod monitor;
pub mod pool;
pub mod source;

pub use monitor::{
    CleanupCallback, CleanupReport, LeakReport, MemoryEvent, MemoryPressureMonitor, MonitorConfig,
    PressureLevel, PressureProbe, PressureSample, PressureThresholds,
};
pub use pool::{
    ConnectionConfig, ConnectionEvent, ConnectionFactory, ConnectionPool, EvictionReason, GcReport,
    ManagedResource, PoolConfig, PoolEvent, PoolStats, PooledConnection, ResourceCleanup,
    ResourceInfo, ResourceKind, ResourcePool,
};
pub use source::{MemoryReading, MemorySource, SystemMemorySource};
