//! Priority loader for images, modules and data with bounded concurrency,
//! linear-backoff retries and a FIFO result cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt, Shared, join_all};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lowtide_core::{Error, ErrorKind, EventBus, Result, Signal, sleep_or_cancel, spawn_periodic};

use crate::gate::PrefetchGate;
use crate::item::{ItemSource, LoadState, LoadStatus, LoadableItem, UrlFetcher};

type SharedItem<T> = Shared<BoxFuture<'static, Result<T>>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`LazyResourceLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Loads running at once. Default: 3
    pub max_concurrency: usize,
    /// Attempts per load before the item is marked failed. Default: 3
    pub retry_attempts: u32,
    /// Base retry delay, multiplied by the attempt number. Default: 1s
    #[serde(with = "lowtide_core::serde_ms")]
    pub retry_delay: Duration,
    /// Loaded items kept in memory. Default: 50
    pub cache_size: usize,
    /// Queue processing period of the background ticker. Default: 100ms
    #[serde(with = "lowtide_core::serde_ms")]
    pub tick_interval: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            cache_size: 50,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl LoaderConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("max_concurrency must be > 0"));
        }
        if self.retry_attempts == 0 {
            return Err(Error::configuration("retry_attempts must be > 0"));
        }
        if self.cache_size == 0 {
            return Err(Error::configuration("cache_size must be > 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::configuration("tick_interval must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted by [`LazyResourceLoader`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// An item loaded and was cached
    ItemLoaded {
        /// Item id
        id: String,
        /// Attempts it took
        attempts: u32,
        /// Time from first attempt to success
        elapsed: Duration,
    },
    /// An item exhausted its attempts
    ItemError {
        /// Item id
        id: String,
        /// Final error
        error: Error,
    },
    /// A cached item was dropped to make room
    Evicted {
        /// Item id
        id: String,
    },
}

impl Signal for LoaderEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ItemLoaded { .. } => "item-loaded",
            Self::ItemError { .. } => "item-error",
            Self::Evicted { .. } => "cache-eviction",
        }
    }
}

/// Outcome of one [`LazyResourceLoader::process_batch`] step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items loaded
    pub loaded: usize,
    /// Items that failed
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// LazyResourceLoader
// ---------------------------------------------------------------------------

struct Slot<T> {
    item: LoadableItem<T>,
    status: LoadStatus,
    attempts: u32,
    error: Option<Error>,
    visible: bool,
    queued: bool,
    seq: u64,
}

/// Loads registered items on demand or from a priority queue.
///
/// Visible items jump the queue, then higher priority wins, then
/// registration order. A request for an item that is already loading awaits
/// the running load instead of starting another.
pub struct LazyResourceLoader<T> {
    config: LoaderConfig,
    fetcher: Option<Arc<dyn UrlFetcher<T>>>,
    gate: PrefetchGate,
    slots: Mutex<HashMap<String, Slot<T>>>,
    cache: Mutex<IndexMap<String, T>>,
    in_flight: DashMap<String, SharedItem<T>>,
    permits: Semaphore,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
    ticker: Mutex<Option<CancellationToken>>,
    events: EventBus<LoaderEvent>,
}

impl<T: Clone + Send + Sync + 'static> LazyResourceLoader<T> {
    /// Create a loader for closure-sourced items.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            permits: Semaphore::new(config.max_concurrency),
            cache: Mutex::new(IndexMap::with_capacity(config.cache_size)),
            config,
            fetcher: None,
            gate: PrefetchGate::new(),
            slots: Mutex::new(HashMap::new()),
            in_flight: DashMap::new(),
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            ticker: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Resolve URL-sourced items through `fetcher`.
    #[must_use]
    pub fn with_url_fetcher(mut self, fetcher: Arc<dyn UrlFetcher<T>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Share `gate` with other caches; [`preload`](Self::preload) refuses
    /// to run while it is closed.
    #[must_use]
    pub fn with_prefetch_gate(mut self, gate: PrefetchGate) -> Self {
        self.gate = gate;
        self
    }

    /// The gate consulted by [`preload`](Self::preload).
    pub fn prefetch_gate(&self) -> &PrefetchGate {
        &self.gate
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Subscribe to loader events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LoaderEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register an item and queue it for background loading.
    ///
    /// Fails on a duplicate id, on a URL item without a fetcher, and on a
    /// dependency that would close a cycle.
    pub fn register(&self, item: LoadableItem<T>) -> Result<()> {
        if item.id.is_empty() {
            return Err(Error::invalid_argument("id", "item id must not be empty"));
        }
        if matches!(item.source, ItemSource::Url(_)) && self.fetcher.is_none() {
            return Err(Error::configuration(format!(
                "item '{}' has a url source but no UrlFetcher is configured",
                item.id
            )));
        }

        let mut slots = self.slots.lock();
        if slots.contains_key(&item.id) {
            return Err(Error::invalid_argument(
                "id",
                format!("item '{}' is already registered", item.id),
            ));
        }
        if let Some(dep) = item
            .dependencies
            .iter()
            .find(|dep| **dep == item.id || reaches(&slots, dep, &item.id))
        {
            return Err(Error::invalid_argument(
                "dependencies",
                format!("'{}' -> '{dep}' would form a dependency cycle", item.id),
            ));
        }

        tracing::trace!(
            item_id = %item.id,
            priority = item.priority,
            kind = ?item.kind,
            "item registered"
        );
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            item.id.clone(),
            Slot {
                item,
                status: LoadStatus::Pending,
                attempts: 0,
                error: None,
                visible: false,
                queued: true,
                seq,
            },
        );
        Ok(())
    }

    /// Mark an item as on screen. Visible items are loaded first. Returns
    /// whether the id is registered.
    pub fn set_visible(&self, id: &str, visible: bool) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(id) else {
            return false;
        };
        slot.visible = visible;
        if visible && slot.status == LoadStatus::Pending {
            slot.queued = true;
        }
        true
    }

    /// Reset a failed item to pending and queue it again. Returns whether the
    /// item was in the error state.
    pub fn retry(&self, id: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(id) {
            Some(slot) if slot.status == LoadStatus::Error => {
                slot.status = LoadStatus::Pending;
                slot.attempts = 0;
                slot.error = None;
                slot.queued = true;
                tracing::debug!(item_id = id, "item reset for retry");
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Cached data, the running load, or a new load of `id`.
    ///
    /// A failed item keeps returning its error until [`retry`](Self::retry).
    pub async fn get_item(self: &Arc<Self>, id: &str) -> Result<T> {
        self.fetch(id.to_owned()).await
    }

    /// Load `ids` concurrently, e.g. before they scroll into view.
    ///
    /// Every id fails with `FeatureDisabled` while the prefetch gate is
    /// closed; nothing is loaded.
    pub async fn preload(self: &Arc<Self>, ids: &[&str]) -> Vec<Result<T>> {
        if let Err(e) = self.gate.check() {
            tracing::debug!(items = ids.len(), "prefetch disabled, preload refused");
            return ids.iter().map(|_| Err(e.clone())).collect();
        }
        join_all(ids.iter().map(|id| self.fetch((*id).to_owned()))).await
    }

    /// State snapshot of `id`.
    pub fn state(&self, id: &str) -> Option<LoadState<T>> {
        let (status, attempts, error) = {
            let slots = self.slots.lock();
            let slot = slots.get(id)?;
            (slot.status, slot.attempts, slot.error.clone())
        };
        let data = self.cached(id);
        Some(LoadState {
            status,
            attempts,
            data,
            error,
        })
    }

    /// Cached ids, oldest first.
    pub fn cached_ids(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }

    /// Queued ids in the order they would be loaded.
    pub fn queued_ids(&self) -> Vec<String> {
        let slots = self.slots.lock();
        let mut ready: Vec<&Slot<T>> = slots
            .values()
            .filter(|s| s.queued && s.status == LoadStatus::Pending)
            .collect();
        ready.sort_by(|a, b| {
            b.visible
                .cmp(&a.visible)
                .then_with(|| b.item.priority.cmp(&a.item.priority))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        ready.into_iter().map(|s| s.item.id.clone()).collect()
    }

    fn cached(&self, id: &str) -> Option<T> {
        self.cache.lock().get(id).cloned()
    }

    fn fetch(self: &Arc<Self>, id: String) -> BoxFuture<'static, Result<T>> {
        if let Some(value) = self.cached(&id) {
            return future::ready(Ok(value)).boxed();
        }
        {
            let slots = self.slots.lock();
            match slots.get(&id) {
                None => {
                    return future::ready(Err(Error::invalid_argument(
                        "id",
                        format!("unknown item '{id}'"),
                    )))
                    .boxed();
                }
                Some(slot) if slot.status == LoadStatus::Error => {
                    let error = slot.error.clone().unwrap_or_else(|| {
                        Error::load_failed(&id, slot.attempts, "previous load failed")
                    });
                    return future::ready(Err(error)).boxed();
                }
                Some(_) => {}
            }
        }

        self.in_flight
            .entry(id.clone())
            .or_insert_with(|| Arc::clone(self).run(id).boxed().shared())
            .value()
            .clone()
            .boxed()
    }

    async fn run(self: Arc<Self>, id: String) -> Result<T> {
        let result = self.load(&id).await;
        self.in_flight.remove(&id);
        result
    }

    async fn load(self: &Arc<Self>, id: &str) -> Result<T> {
        if let Some(value) = self.cached(id) {
            return Ok(value);
        }

        let (source, kind, dependencies) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| Error::invalid_argument("id", format!("unknown item '{id}'")))?;
            slot.status = LoadStatus::Loading;
            slot.queued = false;
            slot.attempts = 0;
            (
                slot.item.source.clone(),
                slot.item.kind,
                slot.item.dependencies.clone(),
            )
        };

        for dep in &dependencies {
            if let Err(e) = self.fetch(dep.clone()).await {
                let error = Error::load_failed(id, 0, format!("dependency '{dep}' failed: {e}"));
                self.fail(id, error.clone());
                return Err(error);
            }
        }

        let started = Instant::now();
        let mut last_error = None;
        for attempt in 1..=self.config.retry_attempts {
            self.set_attempts(id, attempt);
            let result = match self.permits.acquire().await {
                Ok(_permit) => self.invoke(&source, kind).await,
                Err(_) => Err(Error::cancelled("lazy-loader")),
            };

            match result {
                Ok(value) => {
                    self.store(id, value.clone(), attempt, started.elapsed());
                    return Ok(value);
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    self.fail(id, e.clone());
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(item_id = id, attempt, error = %e, "item load attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < self.config.retry_attempts {
                let delay = self.config.retry_delay * attempt;
                if !sleep_or_cancel(delay, &self.shutdown).await {
                    let error = Error::cancelled("lazy-loader");
                    self.fail(id, error.clone());
                    return Err(error);
                }
            }
        }

        let reason = last_error.map_or_else(|| "no attempt made".to_owned(), |e| e.to_string());
        let error = Error::load_failed(id, self.config.retry_attempts, reason);
        self.fail(id, error.clone());
        Err(error)
    }

    async fn invoke(&self, source: &ItemSource<T>, kind: crate::item::ItemKind) -> Result<T> {
        match source {
            ItemSource::Loader(load) => load().await,
            ItemSource::Url(url) => match &self.fetcher {
                Some(fetcher) => fetcher.fetch(url, kind).await,
                None => Err(Error::configuration("no UrlFetcher configured")),
            },
        }
    }

    fn set_attempts(&self, id: &str, attempts: u32) {
        if let Some(slot) = self.slots.lock().get_mut(id) {
            slot.attempts = attempts;
        }
    }

    fn store(&self, id: &str, value: T, attempts: u32, elapsed: Duration) {
        let evicted: Vec<String> = {
            let mut cache = self.cache.lock();
            cache.insert(id.to_owned(), value);
            let overflow = cache.len().saturating_sub(self.config.cache_size);
            cache.drain(..overflow).map(|(k, _)| k).collect()
        };

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(id) {
                slot.status = LoadStatus::Loaded;
                slot.attempts = attempts;
                slot.error = None;
            }
            for key in &evicted {
                if let Some(slot) = slots.get_mut(key) {
                    slot.status = LoadStatus::Pending;
                    slot.attempts = 0;
                }
            }
        }

        tracing::debug!(
            item_id = id,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "item loaded"
        );
        self.events.emit(LoaderEvent::ItemLoaded {
            id: id.to_owned(),
            attempts,
            elapsed,
        });
        for key in evicted {
            tracing::trace!(item_id = %key, "item evicted");
            self.events.emit(LoaderEvent::Evicted { id: key });
        }
    }

    fn fail(&self, id: &str, error: Error) {
        if let Some(slot) = self.slots.lock().get_mut(id) {
            slot.status = LoadStatus::Error;
            slot.error = Some(error.clone());
        }
        tracing::warn!(item_id = id, error = %error, "item load failed");
        self.events.emit(LoaderEvent::ItemError {
            id: id.to_owned(),
            error,
        });
    }

    // -----------------------------------------------------------------------
    // Queue processing
    // -----------------------------------------------------------------------

    /// Load the next batch of queued items, at most `max_concurrency` of them.
    pub async fn process_batch(self: &Arc<Self>) -> BatchReport {
        let batch: Vec<String> = self
            .queued_ids()
            .into_iter()
            .take(self.config.max_concurrency)
            .collect();
        if batch.is_empty() {
            return BatchReport::default();
        }

        let results = join_all(batch.into_iter().map(|id| self.fetch(id))).await;
        let loaded = results.iter().filter(|r| r.is_ok()).count();
        BatchReport {
            loaded,
            failed: results.len() - loaded,
        }
    }

    /// Process the queue every `tick_interval` until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.ticker.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let loader = Arc::clone(self);
        spawn_periodic("lazy-loader", self.config.tick_interval, cancel, move || {
            let loader = Arc::clone(&loader);
            async move {
                let report = loader.process_batch().await;
                if report != BatchReport::default() {
                    tracing::trace!(loaded = report.loaded, failed = report.failed, "loader tick");
                }
            }
        });
    }

    /// Stop the ticker, cancel pending retry sleeps and refuse new loads.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
        self.ticker.lock().take();
        tracing::debug!("lazy loader shut down");
    }
}

/// Whether `target` is reachable from `from` along registered dependencies.
fn reaches<T>(slots: &HashMap<String, Slot<T>>, from: &str, target: &str) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(slot) = slots.get(id) {
            stack.extend(slot.item.dependencies.iter().map(String::as_str));
        }
    }
    false
}

impl<T> std::fmt::Debug for LazyResourceLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyResourceLoader")
            .field("registered", &self.slots.lock().len())
            .field("cached", &self.cache.lock().len())
            .field("in_flight", &self.in_flight.len())
            .field("prefetch", &self.gate.is_enabled())
            .finish_non_exhaustive()
    }
}
