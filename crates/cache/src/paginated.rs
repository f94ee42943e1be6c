//! Page-indexed cache with prefetch, adaptive page sizing and a hybrid
//! recency/frequency eviction score.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use lowtide_core::{Error, EventBus, Result, Signal};

use crate::gate::PrefetchGate;
use crate::page::{Page, PageLoader};

type SharedPage<T> = Shared<BoxFuture<'static, Result<Page<T>>>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`PaginatedCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCacheConfig {
    /// Initial items per page. Default: 20
    pub page_size: u32,
    /// Pages kept in memory. Default: 10
    pub cache_pages: usize,
    /// Pages prefetched ahead of the current one. Default: 2
    pub prefetch_pages: u32,
    /// Age after which a cached page counts as absent. Default: 5min
    #[serde(with = "lowtide_core::serde_ms")]
    pub ttl: Duration,
    /// Jump distance beyond which pending prefetches are aborted. Default: 5
    pub jump_threshold: u32,
    /// Resize pages from observed load times. Default: true
    pub adaptive_page_size: bool,
    /// Smallest adaptive page size. Default: 10
    pub min_page_size: u32,
    /// Largest adaptive page size. Default: 50
    pub max_page_size: u32,
    /// Factor applied when loads are slow. Default: 0.75
    pub shrink_factor: f64,
    /// Factor applied when loads are fast. Default: 1.25
    pub grow_factor: f64,
    /// Average load time above which pages shrink. Default: 2s
    #[serde(with = "lowtide_core::serde_ms")]
    pub slow_load: Duration,
    /// Average load time below which pages grow. Default: 500ms
    #[serde(with = "lowtide_core::serde_ms")]
    pub fast_load: Duration,
    /// Loads averaged per sizing decision. Default: 5
    pub load_samples: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            cache_pages: 10,
            prefetch_pages: 2,
            ttl: Duration::from_secs(5 * 60),
            jump_threshold: 5,
            adaptive_page_size: true,
            min_page_size: 10,
            max_page_size: 50,
            shrink_factor: 0.75,
            grow_factor: 1.25,
            slow_load: Duration::from_secs(2),
            fast_load: Duration::from_millis(500),
            load_samples: 5,
        }
    }
}

impl PageCacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::configuration("page_size must be > 0"));
        }
        if self.cache_pages == 0 {
            return Err(Error::configuration("cache_pages must be > 0"));
        }
        if self.ttl.is_zero() {
            return Err(Error::configuration("ttl must be greater than zero"));
        }
        if !self.adaptive_page_size {
            return Ok(());
        }
        if self.min_page_size == 0 || self.min_page_size > self.max_page_size {
            return Err(Error::configuration(
                "page size bounds must satisfy 0 < min_page_size <= max_page_size",
            ));
        }
        if !(self.min_page_size..=self.max_page_size).contains(&self.page_size) {
            return Err(Error::configuration(
                "page_size must lie within the adaptive bounds",
            ));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(Error::configuration("shrink_factor must be in (0, 1)"));
        }
        if self.grow_factor <= 1.0 {
            return Err(Error::configuration("grow_factor must be > 1"));
        }
        if self.fast_load >= self.slow_load {
            return Err(Error::configuration("fast_load must be below slow_load"));
        }
        if self.load_samples == 0 {
            return Err(Error::configuration("load_samples must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events and stats
// ---------------------------------------------------------------------------

/// Events emitted by [`PaginatedCache`].
#[derive(Debug, Clone, PartialEq)]
pub enum PageCacheEvent {
    /// A page arrived from the loader
    PageLoaded {
        /// Page number
        page: u32,
        /// Items on the page
        items: usize,
        /// Loader time
        elapsed: Duration,
        /// Whether a prefetch started the load
        prefetch: bool,
    },
    /// A cached page was evicted to make room
    Evicted {
        /// Page number
        page: u32,
    },
    /// Adaptive sizing changed the page size and cleared the cache
    PageSizeChanged {
        /// Previous size
        from: u32,
        /// New size
        to: u32,
        /// Average load time that triggered the change
        average_load: Duration,
    },
}

impl Signal for PageCacheEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::PageLoaded { .. } => "page-loaded",
            Self::Evicted { .. } => "cache-eviction",
            Self::PageSizeChanged { .. } => "page-size-changed",
        }
    }
}

/// Counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh pages served from memory
    pub hits: u64,
    /// Requests that had to wait for the loader
    pub misses: u64,
    /// Completed loader calls
    pub loads: u64,
    /// Pages evicted for capacity
    pub evictions: u64,
    /// Prefetch tasks spawned
    pub prefetches: u64,
}

impl CacheStats {
    /// Hits over all requests, 0 when nothing was requested.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Entry<T> {
    page: Page<T>,
    loaded_at: Instant,
    access_count: u64,
}

impl<T> Entry<T> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }

    /// Higher is more worth keeping.
    fn score(&self, now: Instant) -> f64 {
        let age_ms = now.duration_since(self.loaded_at).as_millis().max(1);
        self.access_count as f64 * 1000.0 / age_ms as f64
    }
}

struct State<T> {
    pages: HashMap<u32, Entry<T>>,
    current: u32,
    page_size: u32,
    total_pages: Option<u32>,
    generation: u64,
    load_times: VecDeque<Duration>,
}

impl<T: Clone> State<T> {
    fn hit(&mut self, page: u32, ttl: Duration) -> Option<Page<T>> {
        let fresh = self.pages.get(&page).map(|e| e.is_fresh(ttl))?;
        if !fresh {
            self.pages.remove(&page);
            return None;
        }
        self.pages.get_mut(&page).map(|entry| {
            entry.access_count += 1;
            entry.page.clone()
        })
    }

    fn is_fresh(&self, page: u32, ttl: Duration) -> bool {
        self.pages.get(&page).is_some_and(|e| e.is_fresh(ttl))
    }

    /// Lowest-scoring page other than `incoming`, never the current page or
    /// its neighbours. Equal scores evict the page farthest from the current.
    fn victim(&self, incoming: u32, now: Instant) -> Option<u32> {
        let current = self.current;
        self.pages
            .iter()
            .filter(|(p, _)| **p != incoming && p.abs_diff(current) > 1)
            .min_by(|(pa, a), (pb, b)| {
                a.score(now)
                    .total_cmp(&b.score(now))
                    .then_with(|| pb.abs_diff(current).cmp(&pa.abs_diff(current)))
            })
            .map(|(p, _)| *p)
    }

    fn reset(&mut self) {
        self.pages.clear();
        self.total_pages = None;
        self.load_times.clear();
        self.generation += 1;
    }
}

// ---------------------------------------------------------------------------
// PaginatedCache
// ---------------------------------------------------------------------------

/// Page-indexed cache in front of a host [`PageLoader`].
///
/// Concurrent requests for the same uncached page share one loader call.
pub struct PaginatedCache<T> {
    config: PageCacheConfig,
    loader: Arc<dyn PageLoader<T>>,
    gate: PrefetchGate,
    state: Mutex<State<T>>,
    in_flight: DashMap<(u32, u32), SharedPage<T>>,
    prefetches: Mutex<HashMap<u32, AbortHandle>>,
    stats: Mutex<CacheStats>,
    events: EventBus<PageCacheEvent>,
}

impl<T: Clone + Send + Sync + 'static> PaginatedCache<T> {
    /// Create a cache over `loader`.
    pub fn new(config: PageCacheConfig, loader: Arc<dyn PageLoader<T>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(State {
                pages: HashMap::with_capacity(config.cache_pages),
                current: 0,
                page_size: config.page_size,
                total_pages: None,
                generation: 0,
                load_times: VecDeque::with_capacity(config.load_samples),
            }),
            config,
            loader,
            gate: PrefetchGate::new(),
            in_flight: DashMap::new(),
            prefetches: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            events: EventBus::default(),
        })
    }

    /// Share `gate` with other caches; no prefetch is scheduled while it is
    /// closed.
    #[must_use]
    pub fn with_prefetch_gate(mut self, gate: PrefetchGate) -> Self {
        self.gate = gate;
        self
    }

    /// The gate consulted before prefetching.
    pub fn prefetch_gate(&self) -> &PrefetchGate {
        &self.gate
    }

    /// Cache configuration.
    pub fn config(&self) -> &PageCacheConfig {
        &self.config
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PageCacheEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get page `page` (1-based) and make it the current page.
    ///
    /// A fresh cached page is returned at once and prefetching of the pages
    /// around it is scheduled. Otherwise the loader is called, or an
    /// in-flight load of the same page is awaited.
    pub async fn get_page(self: &Arc<Self>, page: u32) -> Result<Page<T>> {
        validate_page(page)?;

        let cached = {
            let mut state = self.state.lock();
            state.current = page;
            state.hit(page, self.config.ttl)
        };
        if let Some(hit) = cached {
            self.stats.lock().hits += 1;
            tracing::trace!(page, "page cache hit");
            self.schedule_prefetch(page);
            return Ok(hit);
        }

        self.stats.lock().misses += 1;
        self.load(page, false).await
    }

    /// Move to `page`, dropping pending prefetches when the jump is long.
    pub async fn jump_to_page(self: &Arc<Self>, page: u32) -> Result<Page<T>> {
        validate_page(page)?;
        let current = self.current_page();
        if current != 0 && page.abs_diff(current) > self.config.jump_threshold {
            let aborted = self.abort_prefetches();
            tracing::debug!(from = current, to = page, aborted, "long jump, prefetches aborted");
        }
        self.get_page(page).await
    }

    /// Page after the current one.
    pub async fn next_page(self: &Arc<Self>) -> Result<Page<T>> {
        let next = self.current_page().saturating_add(1).max(1);
        self.get_page(next).await
    }

    /// Page before the current one, or the first page.
    pub async fn previous_page(self: &Arc<Self>) -> Result<Page<T>> {
        let previous = self.current_page().saturating_sub(1).max(1);
        self.get_page(previous).await
    }

    fn load(self: &Arc<Self>, page: u32, prefetch: bool) -> SharedPage<T> {
        let page_size = self.state.lock().page_size;
        self.in_flight
            .entry((page, page_size))
            .or_insert_with(|| Arc::clone(self).fetch(page, page_size, prefetch).boxed().shared())
            .value()
            .clone()
    }

    async fn fetch(self: Arc<Self>, page: u32, page_size: u32, prefetch: bool) -> Result<Page<T>> {
        let generation = self.state.lock().generation;
        let started = Instant::now();
        let result = self.loader.load_page(page, page_size).await;
        let elapsed = started.elapsed();

        let loaded = match result {
            Ok(data) => Page::from_data(page, page_size, data),
            Err(e) => {
                self.in_flight.remove(&(page, page_size));
                tracing::warn!(page, page_size, prefetch, error = %e, "page load failed");
                return Err(e);
            }
        };

        let evicted = self.store(generation, loaded.clone());
        self.in_flight.remove(&(page, page_size));
        {
            let mut stats = self.stats.lock();
            stats.loads += 1;
            stats.evictions += evicted.len() as u64;
        }
        for victim in evicted {
            tracing::debug!(page = victim, "page evicted");
            self.events.emit(PageCacheEvent::Evicted { page: victim });
        }

        tracing::debug!(
            page,
            items = loaded.items.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            prefetch,
            "page loaded"
        );
        self.events.emit(PageCacheEvent::PageLoaded {
            page,
            items: loaded.items.len(),
            elapsed,
            prefetch,
        });
        self.record_load_time(elapsed);
        Ok(loaded)
    }

    /// Insert a loaded page, evicting to stay within capacity. Loads that
    /// started before a reset or resize are returned to the caller but not
    /// cached, as are pages that would only fit by evicting the current page
    /// or a neighbour.
    fn store(&self, generation: u64, page: Page<T>) -> Vec<u32> {
        let mut state = self.state.lock();
        if state.generation != generation || state.page_size != page.page_size {
            return Vec::new();
        }
        state.total_pages = Some(page.total_pages);

        let now = Instant::now();
        let number = page.page_number;
        let mut evicted = Vec::new();
        if !state.pages.contains_key(&number) {
            while state.pages.len() >= self.config.cache_pages {
                let Some(victim) = state.victim(number, now) else {
                    tracing::debug!(page = number, "only protected pages cached, not storing");
                    return evicted;
                };
                state.pages.remove(&victim);
                evicted.push(victim);
            }
        }
        state.pages.insert(
            number,
            Entry {
                page,
                loaded_at: now,
                access_count: 1,
            },
        );
        evicted
    }

    // -----------------------------------------------------------------------
    // Adaptive sizing
    // -----------------------------------------------------------------------

    fn record_load_time(&self, elapsed: Duration) {
        if !self.config.adaptive_page_size {
            return;
        }

        let change = {
            let mut state = self.state.lock();
            state.load_times.push_back(elapsed);
            while state.load_times.len() > self.config.load_samples {
                state.load_times.pop_front();
            }
            if state.load_times.len() < self.config.load_samples {
                return;
            }

            let average =
                state.load_times.iter().sum::<Duration>() / state.load_times.len() as u32;
            let from = state.page_size;
            let to = self.resized(from, average);
            if to == from {
                None
            } else {
                state.page_size = to;
                state.reset();
                Some((from, to, average))
            }
        };

        if let Some((from, to, average_load)) = change {
            self.abort_prefetches();
            tracing::info!(
                from,
                to,
                average_ms = average_load.as_millis() as u64,
                "page size adapted"
            );
            self.events.emit(PageCacheEvent::PageSizeChanged {
                from,
                to,
                average_load,
            });
        }
    }

    fn resized(&self, size: u32, average: Duration) -> u32 {
        let c = &self.config;
        if average > c.slow_load {
            ((f64::from(size) * c.shrink_factor).round() as u32).max(c.min_page_size)
        } else if average < c.fast_load {
            ((f64::from(size) * c.grow_factor).round() as u32).min(c.max_page_size)
        } else {
            size
        }
    }

    // -----------------------------------------------------------------------
    // Prefetch
    // -----------------------------------------------------------------------

    fn schedule_prefetch(self: &Arc<Self>, current: u32) {
        if self.config.prefetch_pages == 0 {
            return;
        }
        if !self.gate.is_enabled() {
            tracing::trace!(page = current, "prefetch gate closed");
            return;
        }

        let (targets, page_size) = {
            let state = self.state.lock();
            let last = state.total_pages;
            let ahead = (1..=self.config.prefetch_pages).filter_map(|d| current.checked_add(d));
            let behind = current.checked_sub(1).filter(|p| *p >= 1);
            let targets: Vec<u32> = ahead
                .chain(behind)
                .filter(|p| last.is_none_or(|l| *p <= l))
                .filter(|p| !state.is_fresh(*p, self.config.ttl))
                .collect();
            (targets, state.page_size)
        };

        let mut prefetches = self.prefetches.lock();
        for page in targets {
            if prefetches.get(&page).is_some_and(|h| !h.is_finished())
                || self.in_flight.contains_key(&(page, page_size))
            {
                continue;
            }
            let cache = Arc::clone(self);
            let handle = tokio::spawn(async move {
                if let Err(e) = cache.load(page, true).await {
                    tracing::debug!(page, error = %e, "prefetch failed");
                }
            });
            prefetches.insert(page, handle.abort_handle());
            self.stats.lock().prefetches += 1;
        }
    }

    fn abort_prefetches(&self) -> usize {
        let mut prefetches = self.prefetches.lock();
        let live = prefetches.values().filter(|h| !h.is_finished()).count();
        for (_, handle) in prefetches.drain() {
            handle.abort();
        }
        live
    }

    // -----------------------------------------------------------------------
    // Introspection and lifecycle
    // -----------------------------------------------------------------------

    /// Drop every cached page.
    pub fn invalidate(&self) {
        self.state.lock().reset();
        self.abort_prefetches();
        tracing::debug!("page cache invalidated");
    }

    /// Cached page numbers, ascending.
    pub fn cached_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.state.lock().pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Current items per page.
    pub fn page_size(&self) -> u32 {
        self.state.lock().page_size
    }

    /// Last page requested, 0 before the first request.
    pub fn current_page(&self) -> u32 {
        self.state.lock().current
    }

    /// Total pages reported by the most recent load, if any.
    pub fn total_pages(&self) -> Option<u32> {
        self.state.lock().total_pages
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    /// Abort prefetches and drop all cached state.
    pub fn shutdown(&self) {
        let aborted = self.abort_prefetches();
        self.state.lock().reset();
        self.in_flight.clear();
        tracing::debug!(aborted, "page cache shut down");
    }
}

fn validate_page(page: u32) -> Result<()> {
    if page == 0 {
        return Err(Error::invalid_argument("page", "page numbers start at 1"));
    }
    Ok(())
}

impl<T> std::fmt::Debug for PaginatedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PaginatedCache")
            .field("current", &state.current)
            .field("page_size", &state.page_size)
            .field("cached", &state.pages.len())
            .field("in_flight", &self.in_flight.len())
            .field("prefetch", &self.gate.is_enabled())
            .finish_non_exhaustive()
    }
}
