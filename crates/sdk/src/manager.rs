//! The [`AdaptiveManager`] façade.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lowtide_cache::{LazyResourceLoader, PageLoader, PaginatedCache, PrefetchGate};
use lowtide_core::{
    AppState, BatterySource, BatteryStatus, NetworkConditions, NetworkSource, Result,
};
use lowtide_memory::{
    MemoryEvent, MemoryPressureMonitor, MemoryReading, MemorySource, PressureProbe, PressureSample,
    ResourcePool, SystemMemorySource,
};
use lowtide_power::{PowerEvent, PowerProfileController, ProfileKind};
use lowtide_stream::WindowedAggregator;
use lowtide_sync::{ChunkTransport, NetworkSyncScheduler, NoopWakeLock, WakeLock};

use crate::config::ManagerConfig;
use crate::stats::EventStats;

// ---------------------------------------------------------------------------
// Host bindings
// ---------------------------------------------------------------------------

/// Platform collaborators supplied by the host application.
#[derive(Clone)]
pub struct HostBindings {
    memory: Arc<dyn MemorySource>,
    battery: Option<Arc<dyn BatterySource>>,
    network: Option<Arc<dyn NetworkSource>>,
    transport: Arc<dyn ChunkTransport>,
    wake_lock: Arc<dyn WakeLock>,
}

impl HostBindings {
    /// Bindings with `sysinfo` memory readings, no wake lock and no polled
    /// battery or network sources.
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            memory: Arc::new(SystemMemorySource::new()),
            battery: None,
            network: None,
            transport,
            wake_lock: Arc::new(NoopWakeLock),
        }
    }

    /// Read memory from `source` instead of `sysinfo`.
    #[must_use]
    pub fn with_memory_source(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.memory = source;
        self
    }

    /// Poll `source` for battery state. Without one the host pushes through
    /// [`AdaptiveManager::on_battery`].
    #[must_use]
    pub fn with_battery_source(mut self, source: Arc<dyn BatterySource>) -> Self {
        self.battery = Some(source);
        self
    }

    /// Poll `source` before each sync run. Without one the host pushes through
    /// [`AdaptiveManager::on_network`].
    #[must_use]
    pub fn with_network_source(mut self, source: Arc<dyn NetworkSource>) -> Self {
        self.network = Some(source);
        self
    }

    /// Hold `lock` while the sync queue is processed.
    #[must_use]
    pub fn with_wake_lock(mut self, lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = lock;
        self
    }
}

impl fmt::Debug for HostBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBindings")
            .field("battery_source", &self.battery.is_some())
            .field("network_source", &self.network.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AdaptiveManager
// ---------------------------------------------------------------------------

/// Owns one of each controller and wires them together.
///
/// Memory pressure drives the resource pool: a warning or critical sample
/// runs an unforced GC, an out-of-memory sample runs a forced GC followed by
/// the registered cleanup callbacks. Profile changes and battery samples refresh
/// the sync interval and quality, and open or close the prefetch gate shared
/// by every cache and loader the manager builds.
pub struct AdaptiveManager {
    config: ManagerConfig,
    monitor: Arc<MemoryPressureMonitor>,
    pool: Arc<ResourcePool>,
    power: Arc<PowerProfileController>,
    sync: Arc<NetworkSyncScheduler>,
    battery: Option<Arc<dyn BatterySource>>,
    network: Option<Arc<dyn NetworkSource>>,
    prefetch: PrefetchGate,
    stats: EventStats,
    cancel: Mutex<Option<CancellationToken>>,
}

impl AdaptiveManager {
    /// Build every controller from `config`.
    pub fn new(config: ManagerConfig, host: HostBindings) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(MemoryPressureMonitor::new(config.memory.clone(), host.memory)?);
        let probe: Arc<dyn PressureProbe> = monitor.clone();
        let pool = Arc::new(ResourcePool::new(config.pool.clone(), probe)?);
        let power = Arc::new(PowerProfileController::new(config.power.clone())?);
        let sync = Arc::new(NetworkSyncScheduler::new(
            config.sync.clone(),
            Arc::clone(&power),
            host.transport,
            host.wake_lock,
        )?);
        let prefetch = PrefetchGate::with_enabled(power.current_profile().prefetch_enabled);

        Ok(Self {
            config,
            monitor,
            pool,
            power,
            sync,
            battery: host.battery,
            network: host.network,
            prefetch,
            stats: EventStats::default(),
            cancel: Mutex::new(None),
        })
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Memory pressure monitor.
    pub fn monitor(&self) -> &Arc<MemoryPressureMonitor> {
        &self.monitor
    }

    /// Resource pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Power profile controller.
    pub fn power(&self) -> &Arc<PowerProfileController> {
        &self.power
    }

    /// Network sync scheduler.
    pub fn sync(&self) -> &Arc<NetworkSyncScheduler> {
        &self.sync
    }

    /// Prefetch gate installed in every cache and loader built by the
    /// factories. Follows the active power profile.
    pub fn prefetch_gate(&self) -> &PrefetchGate {
        &self.prefetch
    }

    /// Event counters. Populated while the manager is running.
    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    /// Whether [`start`](Self::start) was called without a matching
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Factories
    // -----------------------------------------------------------------------

    /// A paginated cache over `loader` using the configured page defaults.
    pub fn paginated_cache<T>(
        &self,
        loader: Arc<dyn PageLoader<T>>,
    ) -> Result<Arc<PaginatedCache<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cache = PaginatedCache::new(self.config.pages.clone(), loader)?;
        Ok(Arc::new(cache.with_prefetch_gate(self.prefetch.clone())))
    }

    /// A lazy loader using the configured loader defaults.
    pub fn lazy_loader<T>(&self) -> Result<Arc<LazyResourceLoader<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let loader = LazyResourceLoader::new(self.config.loader.clone())?;
        Ok(Arc::new(loader.with_prefetch_gate(self.prefetch.clone())))
    }

    /// A windowed aggregator using the configured window shape.
    pub fn aggregator<T: Clone>(&self) -> Result<WindowedAggregator<T>> {
        WindowedAggregator::new(self.config.windows)
    }

    // -----------------------------------------------------------------------
    // Host signals
    // -----------------------------------------------------------------------

    /// Feed a battery observation to the power controller and re-derive the
    /// sync schedule.
    pub async fn on_battery(&self, status: BatteryStatus) -> ProfileKind {
        let kind = self.power.on_battery_sample(status).await;
        self.sync.refresh();
        self.apply_prefetch_policy();
        kind
    }

    /// Feed new network conditions to the sync scheduler.
    pub fn on_network(&self, conditions: NetworkConditions) {
        self.sync.update_network(conditions);
    }

    /// Forward a foreground/background transition to every controller.
    pub fn on_app_state(&self, state: AppState) {
        tracing::debug!(?state, "app state changed");
        self.monitor.set_app_state(state);
        self.power.set_app_state(state);
        self.sync.set_app_state(state);
        self.sync.refresh();
        self.apply_prefetch_policy();
    }

    /// Record a memory reading pushed by the host.
    pub fn on_memory(&self, reading: MemoryReading) -> PressureSample {
        self.monitor.record(reading)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every controller loop, the pressure bridge and the event
    /// counters. Polled sources are read once immediately. Calling `start`
    /// twice restarts the bridges.
    pub async fn start(&self) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        self.stats.spawn_collector(self.monitor.subscribe(), cancel.child_token());
        self.stats.spawn_collector(self.pool.subscribe(), cancel.child_token());
        self.stats.spawn_collector(self.power.subscribe(), cancel.child_token());
        self.stats.spawn_collector(self.sync.subscribe(), cancel.child_token());
        self.spawn_pressure_bridge(cancel.child_token());
        self.spawn_profile_bridge(cancel.child_token());

        if let Some(source) = &self.network {
            self.sync.update_network(source.conditions());
        }
        if let Some(source) = &self.battery {
            match source.battery() {
                Ok(status) => {
                    self.on_battery(status).await;
                }
                Err(e) => tracing::warn!(error = %e, "initial battery read failed"),
            }
            self.power.start(Arc::clone(source));
        }

        self.monitor.start();
        self.pool.start();
        self.sync.start(self.network.clone());
        tracing::info!("adaptive manager started");
    }

    /// Stop every loop and release every pooled resource.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.monitor.stop();
        self.power.stop();
        self.sync.stop();
        self.pool.shutdown().await;
        tracing::info!("adaptive manager stopped");
    }

    fn spawn_pressure_bridge(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let monitor = Arc::clone(&self.monitor);
        spawn_listener("pressure-bridge", self.monitor.subscribe(), cancel, move |event| {
            let pool = Arc::clone(&pool);
            let monitor = Arc::clone(&monitor);
            async move {
                match event {
                    MemoryEvent::Warning(sample) | MemoryEvent::Critical(sample) => {
                        tracing::debug!(
                            percent = sample.percent_used,
                            "memory pressure, collecting"
                        );
                        pool.trigger_gc(false).await;
                    }
                    MemoryEvent::Oom(sample) => {
                        tracing::warn!(
                            percent = sample.percent_used,
                            "memory exhausted, forcing cleanup"
                        );
                        pool.trigger_gc(true).await;
                        monitor.force_cleanup().await;
                    }
                    _ => {}
                }
            }
        })
    }

    fn spawn_profile_bridge(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sync = Arc::clone(&self.sync);
        let power = Arc::clone(&self.power);
        let prefetch = self.prefetch.clone();
        spawn_listener("profile-bridge", self.power.subscribe(), cancel, move |event| {
            if let PowerEvent::ProfileChanged { .. } = event {
                sync.refresh();
                prefetch.set_enabled(power.current_profile().prefetch_enabled);
            }
            async {}
        })
    }

    fn apply_prefetch_policy(&self) {
        self.prefetch.set_enabled(self.power.current_profile().prefetch_enabled);
    }
}

impl fmt::Debug for AdaptiveManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveManager")
            .field("profile", &self.power.current_kind())
            .field("resources", &self.pool.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Drive `handler` with every event on `receiver` until `cancel` fires or the
/// bus is dropped. Lagged receivers skip ahead.
pub(crate) fn spawn_listener<E, F, Fut>(
    name: &'static str,
    mut receiver: broadcast::Receiver<E>,
    cancel: CancellationToken,
    mut handler: F,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: FnMut(E) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = receiver.recv() => match result {
                    Ok(event) => handler(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(listener = name, skipped, "listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        tracing::trace!(listener = name, "listener stopped");
    })
}
