//! Priority-ordered registry of owned resources.
//!
//! [`ResourcePool`] is the only owner of registered resources and the only
//! component allowed to run their cleanup. Other components hold ids, never
//! handles. Garbage collection removes inactive resources lowest priority
//! first until memory pressure drops below the configured target, then halves
//! every auxiliary pool.

mod connection;

pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionFactory, ConnectionPool, EvictionReason,
    PooledConnection,
};

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lowtide_core::{Error, EventBus, Result, Signal, spawn_periodic};

use crate::monitor::PressureProbe;

/// One-shot async cleanup owned by a [`ManagedResource`].
pub type ResourceCleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Resource pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pressure (percent) at or above which an unforced GC runs. Default: 80
    pub gc_threshold: f64,
    /// GC stops once pressure falls below this. Default: 60
    pub gc_target: f64,
    /// Capacity of each auxiliary pool. Default: 50
    pub max_pool_size: usize,
    /// Inactive resources idle longer than this are swept. Default: 5min
    #[serde(with = "lowtide_core::serde_ms")]
    pub max_idle_time: Duration,
    /// Period of the idle sweep. Default: 60s
    #[serde(with = "lowtide_core::serde_ms")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 80.0,
            gc_target: 60.0,
            max_pool_size: 50,
            max_idle_time: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.gc_threshold) || !(0.0..=100.0).contains(&self.gc_target) {
            return Err(Error::configuration("gc_threshold and gc_target must be in [0, 100]"));
        }
        if self.gc_target > self.gc_threshold {
            return Err(Error::configuration("gc_target must not exceed gc_threshold"));
        }
        if self.max_pool_size == 0 {
            return Err(Error::configuration("max_pool_size must be > 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::configuration("sweep_interval must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ManagedResource
// ---------------------------------------------------------------------------

/// What a managed resource holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Network or database connection
    Connection,
    /// Raw byte buffer
    Buffer,
    /// In-memory cache
    Cache,
    /// Memoised computation result
    Computation,
    /// Persistent storage handle
    Storage,
}

/// A resource handed to the pool for ownership.
pub struct ManagedResource {
    id: String,
    kind: ResourceKind,
    size_bytes: u64,
    priority: i32,
    cleanup: Option<ResourceCleanup>,
}

impl ManagedResource {
    /// Describe a resource with priority 0 and no cleanup.
    pub fn new(id: impl Into<String>, kind: ResourceKind, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            size_bytes,
            priority: 0,
            cleanup: None,
        }
    }

    /// Set the eviction priority. Lower values are evicted first.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach an async cleanup run exactly once when the resource is removed.
    #[must_use]
    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.cleanup = Some(Box::new(move || cleanup().boxed()));
        self
    }

    /// Resource id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for ManagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedResource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size_bytes", &self.size_bytes)
            .field("priority", &self.priority)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Read-only snapshot of a registered resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Resource id
    pub id: String,
    /// Resource kind
    pub kind: ResourceKind,
    /// Reported size
    pub size_bytes: u64,
    /// Eviction priority
    pub priority: i32,
    /// Last acquire, release or touch
    pub last_used_at: Instant,
    /// Whether the resource is currently in use
    pub is_active: bool,
}

struct Entry {
    info: ResourceInfo,
    cleanup: Option<ResourceCleanup>,
}

// ---------------------------------------------------------------------------
// Reports and events
// ---------------------------------------------------------------------------

/// Outcome of [`ResourcePool::trigger_gc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GcReport {
    /// Whether the collection ran
    pub triggered: bool,
    /// Whether it was forced
    pub forced: bool,
    /// Resources removed with a clean shutdown
    pub cleaned: usize,
    /// Resources removed whose cleanup failed
    pub failed: usize,
    /// Bytes released by removed resources
    pub freed_bytes: u64,
    /// Auxiliary pool entries dropped
    pub pooled_dropped: usize,
    /// Pressure when the collection started
    pub pressure_before: f64,
    /// Pressure when the collection finished
    pub pressure_after: f64,
}

/// Pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Registered resources
    pub resources: usize,
    /// Resources currently acquired
    pub active: usize,
    /// Sum of registered sizes
    pub total_bytes: u64,
    /// Entry count of each auxiliary pool
    pub pools: BTreeMap<String, usize>,
}

/// Events emitted by the resource pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A resource was registered
    Registered {
        /// Resource id
        id: String,
        /// Resource kind
        kind: ResourceKind,
    },
    /// A resource was removed and its cleanup ran
    Removed {
        /// Resource id
        id: String,
        /// Bytes released
        freed_bytes: u64,
    },
    /// A cleanup failed; the resource was removed regardless
    CleanupFailed {
        /// Resource id
        id: String,
        /// The cleanup error
        error: Error,
    },
    /// A collection started
    GcStarted {
        /// Whether it was forced
        forced: bool,
        /// Pressure at the start
        pressure: f64,
    },
    /// A collection finished
    GcCompleted(GcReport),
}

impl Signal for PoolEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "resource-registered",
            Self::Removed { .. } => "resource-removed",
            Self::CleanupFailed { .. } => "resource-cleanup-failed",
            Self::GcStarted { .. } => "gc-started",
            Self::GcCompleted(_) => "gc-completed",
        }
    }
}

// ---------------------------------------------------------------------------
// ResourcePool
// ---------------------------------------------------------------------------

/// Owner of registered resources and auxiliary object pools.
pub struct ResourcePool {
    config: PoolConfig,
    probe: Arc<dyn PressureProbe>,
    resources: Mutex<HashMap<String, Entry>>,
    pools: Mutex<HashMap<String, VecDeque<Box<dyn Any + Send>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventBus<PoolEvent>,
}

impl ResourcePool {
    /// Create a pool reading pressure from `probe`.
    pub fn new(config: PoolConfig, probe: Arc<dyn PressureProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            probe,
            resources: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            cancel: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Take ownership of a resource. Ids must be unique.
    pub fn register(&self, resource: ManagedResource) -> Result<()> {
        let ManagedResource {
            id,
            kind,
            size_bytes,
            priority,
            cleanup,
        } = resource;

        {
            let mut resources = self.resources.lock();
            if resources.contains_key(&id) {
                return Err(Error::invalid_argument(
                    "id",
                    format!("resource '{id}' is already registered"),
                ));
            }
            resources.insert(
                id.clone(),
                Entry {
                    info: ResourceInfo {
                        id: id.clone(),
                        kind,
                        size_bytes,
                        priority,
                        last_used_at: Instant::now(),
                        is_active: false,
                    },
                    cleanup,
                },
            );
        }

        tracing::debug!(resource_id = %id, ?kind, size_bytes, priority, "resource registered");
        self.events.emit(PoolEvent::Registered { id, kind });
        Ok(())
    }

    /// Remove a resource and run its cleanup.
    ///
    /// The resource leaves the index even when cleanup fails; the failure is
    /// logged and emitted. Returns `false` for unknown ids.
    pub async fn unregister(&self, id: &str) -> bool {
        let entry = self.resources.lock().remove(id);
        match entry {
            Some(entry) => {
                self.finish_removal(entry).await;
                true
            }
            None => false,
        }
    }

    /// Mark a resource in use. Active resources are never collected.
    pub fn acquire(&self, id: &str) -> bool {
        self.update(id, |info| info.is_active = true)
    }

    /// Mark a resource idle.
    pub fn release(&self, id: &str) -> bool {
        self.update(id, |info| info.is_active = false)
    }

    /// Refresh a resource's last-used timestamp.
    pub fn touch(&self, id: &str) -> bool {
        self.update(id, |_| {})
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ResourceInfo)) -> bool {
        let mut resources = self.resources.lock();
        match resources.get_mut(id) {
            Some(entry) => {
                f(&mut entry.info);
                entry.info.last_used_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of one resource.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<ResourceInfo> {
        self.resources.lock().get(id).map(|e| e.info.clone())
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.lock().contains_key(id)
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    /// Whether no resource is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }

    /// Occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let resources = self.resources.lock();
        let pools = self.pools.lock();
        PoolStats {
            resources: resources.len(),
            active: resources.values().filter(|e| e.info.is_active).count(),
            total_bytes: resources.values().map(|e| e.info.size_bytes).sum(),
            pools: pools.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Collect inactive resources.
    ///
    /// Unless `force` is set, nothing happens while pressure is below
    /// `gc_threshold`. Inactive resources are cleaned lowest priority first
    /// (oldest first among equal priorities) until pressure falls below
    /// `gc_target`, forced or not. Every auxiliary pool is halved afterwards.
    pub async fn trigger_gc(&self, force: bool) -> GcReport {
        let pressure_before = self.probe.current_percent().unwrap_or(0.0);
        if !force && pressure_before < self.config.gc_threshold {
            return GcReport {
                pressure_before,
                pressure_after: pressure_before,
                ..GcReport::default()
            };
        }

        tracing::info!(forced = force, pressure = pressure_before, "resource gc started");
        self.events.emit(PoolEvent::GcStarted {
            forced: force,
            pressure: pressure_before,
        });

        let mut candidates: Vec<(i32, Instant, String)> = self
            .resources
            .lock()
            .values()
            .filter(|e| !e.info.is_active)
            .map(|e| (e.info.priority, e.info.last_used_at, e.info.id.clone()))
            .collect();
        candidates.sort();

        let mut report = GcReport {
            triggered: true,
            forced: force,
            pressure_before,
            ..GcReport::default()
        };
        let mut pressure = pressure_before;

        for (_, _, id) in candidates {
            if pressure < self.config.gc_target {
                break;
            }
            // Re-check under the lock: the resource may have been acquired or
            // removed since the candidate list was built.
            let entry = {
                let mut resources = self.resources.lock();
                match resources.get(&id) {
                    Some(e) if !e.info.is_active => resources.remove(&id),
                    _ => None,
                }
            };
            let Some(entry) = entry else { continue };

            report.freed_bytes += entry.info.size_bytes;
            if self.finish_removal(entry).await {
                report.cleaned += 1;
            } else {
                report.failed += 1;
            }
            pressure = self.probe.current_percent().unwrap_or(pressure);
        }

        report.pooled_dropped = self.halve_pools();
        report.pressure_after = self.probe.current_percent().unwrap_or(pressure);

        tracing::info!(
            cleaned = report.cleaned,
            failed = report.failed,
            freed_bytes = report.freed_bytes,
            pressure = report.pressure_after,
            "resource gc completed"
        );
        self.events.emit(PoolEvent::GcCompleted(report));
        report
    }

    /// Remove inactive resources idle longer than `max_idle_time`.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut resources = self.resources.lock();
            let ids: Vec<String> = resources
                .values()
                .filter(|e| {
                    !e.info.is_active
                        && now.duration_since(e.info.last_used_at) > self.config.max_idle_time
                })
                .map(|e| e.info.id.clone())
                .collect();
            ids.iter().filter_map(|id| resources.remove(id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            self.finish_removal(entry).await;
        }
        if count > 0 {
            tracing::debug!(count, "idle resources swept");
        }
        count
    }

    /// Run cleanup for a removed entry. Returns whether it succeeded.
    async fn finish_removal(&self, mut entry: Entry) -> bool {
        let id = entry.info.id.clone();
        let freed_bytes = entry.info.size_bytes;

        let outcome = match entry.cleanup.take() {
            Some(cleanup) => match AssertUnwindSafe(async move { cleanup().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::cleanup(&id, "cleanup panicked")),
            },
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.events.emit(PoolEvent::Removed { id, freed_bytes });
                true
            }
            Err(error) => {
                tracing::warn!(resource_id = %id, error = %error, "resource cleanup failed");
                self.events.emit(PoolEvent::CleanupFailed {
                    id: id.clone(),
                    error,
                });
                self.events.emit(PoolEvent::Removed { id, freed_bytes });
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Auxiliary pools
    // -----------------------------------------------------------------------

    /// Push a reusable object onto the named pool.
    ///
    /// When the pool is at `max_pool_size` the oldest entry is dropped.
    pub fn add_to_pool<T: Send + 'static>(&self, name: &str, item: T) {
        let mut pools = self.pools.lock();
        let pool = pools.entry(name.to_string()).or_default();
        pool.push_back(Box::new(item));
        while pool.len() > self.config.max_pool_size {
            pool.pop_front();
        }
    }

    /// Take the most recently pooled object from the named pool.
    ///
    /// Returns `None` when the pool is empty or its newest entry is not a `T`;
    /// a mismatched entry stays in the pool.
    pub fn get_from_pool<T: Send + 'static>(&self, name: &str) -> Option<T> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(name)?;
        let item = pool.pop_back()?;
        match item.downcast::<T>() {
            Ok(item) => Some(*item),
            Err(item) => {
                pool.push_back(item);
                None
            }
        }
    }

    /// Entry count of the named pool.
    #[must_use]
    pub fn pool_len(&self, name: &str) -> usize {
        self.pools.lock().get(name).map_or(0, VecDeque::len)
    }

    fn halve_pools(&self) -> usize {
        let mut dropped = 0;
        for pool in self.pools.lock().values_mut() {
            let excess = pool.len() - pool.len() / 2;
            pool.drain(..excess);
            dropped += excess;
        }
        dropped
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the periodic idle sweep.
    pub fn start(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let pool = Arc::clone(self);
        spawn_periodic("resource-sweep", self.config.sweep_interval, cancel, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.sweep_idle().await;
            }
        });
    }

    /// Stop the sweep, clean every resource (active or not) and empty the
    /// auxiliary pools.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let entries: Vec<Entry> = self.resources.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.finish_removal(entry).await;
        }
        self.pools.lock().clear();
        tracing::debug!("resource pool shut down");
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("resources", &self.resources.lock().len())
            .field("pools", &self.pools.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(f64);

    impl PressureProbe for FixedProbe {
        fn current_percent(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn pool(pressure: f64) -> ResourcePool {
        ResourcePool::new(PoolConfig::default(), Arc::new(FixedProbe(pressure))).unwrap()
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let pool = pool(10.0);
        pool.register(ManagedResource::new("a", ResourceKind::Buffer, 10))
            .unwrap();
        let err = pool
            .register(ManagedResource::new("a", ResourceKind::Cache, 10))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn unregister_removes_even_when_cleanup_fails() {
        let pool = pool(10.0);
        let mut rx = pool.subscribe();
        pool.register(
            ManagedResource::new("db", ResourceKind::Connection, 0)
                .with_cleanup(|| async { Err(Error::cleanup("db", "socket closed")) }),
        )
        .unwrap();

        assert!(pool.unregister("db").await);
        assert!(!pool.contains("db"));
        assert!(!pool.unregister("db").await);

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            ["resource-registered", "resource-cleanup-failed", "resource-removed"]
        );
    }

    #[tokio::test]
    async fn unforced_gc_below_threshold_is_noop() {
        let pool = pool(50.0);
        pool.register(ManagedResource::new("a", ResourceKind::Buffer, 10))
            .unwrap();
        let report = pool.trigger_gc(false).await;
        assert!(!report.triggered);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn forced_gc_skips_active_resources() {
        let pool = pool(95.0);
        let cleaned = Arc::new(AtomicUsize::new(0));
        for id in ["a", "b", "c"] {
            let cleaned = Arc::clone(&cleaned);
            let resource = ManagedResource::new(id, ResourceKind::Buffer, 100);
            pool.register(resource.with_cleanup(move || async move {
                cleaned.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.acquire("b");

        let report = pool.trigger_gc(true).await;
        assert!(report.triggered);
        assert_eq!(report.cleaned, 2);
        assert_eq!(report.freed_bytes, 200);
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
        assert!(pool.contains("b"));
    }

    #[tokio::test]
    async fn forced_gc_below_target_cleans_nothing() {
        let pool = pool(50.0);
        for id in ["a", "b", "c"] {
            pool.register(ManagedResource::new(id, ResourceKind::Buffer, 100))
                .unwrap();
        }

        let report = pool.trigger_gc(true).await;
        assert!(report.triggered);
        assert!(report.forced);
        assert_eq!(report.cleaned, 0);
        assert_eq!(report.freed_bytes, 0);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn aux_pool_is_lifo_and_bounded() {
        let config = PoolConfig {
            max_pool_size: 3,
            ..PoolConfig::default()
        };
        let pool = ResourcePool::new(config, Arc::new(FixedProbe(0.0))).unwrap();
        for i in 0..5_u32 {
            pool.add_to_pool("buffers", i);
        }
        assert_eq!(pool.pool_len("buffers"), 3);
        assert_eq!(pool.get_from_pool::<u32>("buffers"), Some(4));
        assert_eq!(pool.get_from_pool::<String>("buffers"), None);
        assert_eq!(pool.pool_len("buffers"), 2);
        assert_eq!(pool.get_from_pool::<u32>("missing"), None);
    }

    #[tokio::test]
    async fn gc_halves_aux_pools_dropping_oldest() {
        let pool = pool(90.0);
        for i in 0..6_u32 {
            pool.add_to_pool("frames", i);
        }
        let report = pool.trigger_gc(false).await;
        assert_eq!(report.pooled_dropped, 3);
        assert_eq!(pool.get_from_pool::<u32>("frames"), Some(5));
        assert_eq!(pool.get_from_pool::<u32>("frames"), Some(4));
        assert_eq!(pool.get_from_pool::<u32>("frames"), Some(3));
        assert_eq!(pool.get_from_pool::<u32>("frames"), None);
    }

    #[test]
    fn config_rejects_target_above_threshold() {
        let config = PoolConfig {
            gc_threshold: 50.0,
            gc_target: 70.0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
