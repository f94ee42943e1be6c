//! Manager wiring with in-memory host collaborators

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use lowtide::prelude::*;

struct FixedMemory(Mutex<MemoryReading>);

impl FixedMemory {
    fn percent(percent: u64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(MemoryReading::new(percent, 100))))
    }
}

impl MemorySource for FixedMemory {
    fn read(&self) -> Result<MemoryReading> {
        Ok(*self.0.lock())
    }
}

struct FixedBattery(BatteryStatus);

impl BatterySource for FixedBattery {
    fn battery(&self) -> Result<BatteryStatus> {
        Ok(self.0)
    }
}

struct Offline;

impl NetworkSource for Offline {
    fn conditions(&self) -> NetworkConditions {
        NetworkConditions::offline()
    }
}

struct Sink;

#[async_trait]
impl ChunkTransport for Sink {
    async fn transfer_chunk(&self, _chunk: &Chunk) -> Result<()> {
        Ok(())
    }
}

fn host(memory: Arc<FixedMemory>) -> HostBindings {
    HostBindings::new(Arc::new(Sink)).with_memory_source(memory)
}

fn manager(memory: Arc<FixedMemory>) -> AdaptiveManager {
    AdaptiveManager::new(ManagerConfig::default(), host(memory)).unwrap()
}

fn counted_resource(id: &str, cleaned: &Arc<AtomicUsize>) -> ManagedResource {
    let cleaned = Arc::clone(cleaned);
    ManagedResource::new(id, ResourceKind::Cache, 4_096).with_cleanup(move || async move {
        cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn critical_pressure_collects_inactive_resources() {
    let memory = FixedMemory::percent(90);
    let manager = manager(Arc::clone(&memory));
    let cleaned = Arc::new(AtomicUsize::new(0));
    manager.start().await;

    manager.pool().register(counted_resource("thumbs", &cleaned)).unwrap();
    manager.pool().register(counted_resource("session", &cleaned)).unwrap();
    manager.pool().acquire("session");

    manager.on_memory(MemoryReading::new(90, 100));
    settle().await;

    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert!(manager.pool().contains("session"));
    assert_eq!(manager.stats().count("memory-critical"), 1);
    assert_eq!(manager.stats().count("gc-completed"), 1);
    assert_eq!(manager.stats().count("memory-cleanup"), 0);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn oom_forces_gc_and_runs_cleanup_callbacks() {
    let memory = FixedMemory::percent(97);
    let manager = manager(Arc::clone(&memory));
    let cleaned = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));
    manager.start().await;

    manager.pool().register(counted_resource("decoded", &cleaned)).unwrap();
    let counter = Arc::clone(&callbacks);
    manager.monitor().register_cleanup_callback(
        "image-cache",
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }),
    );

    manager.on_memory(MemoryReading::new(97, 100));
    settle().await;

    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().count("memory-oom"), 1);
    assert_eq!(manager.stats().count("gc-started"), 1);
    assert_eq!(manager.stats().count("memory-cleanup"), 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn warning_pressure_leaves_the_pool_alone() {
    let manager = manager(FixedMemory::percent(75));
    let cleaned = Arc::new(AtomicUsize::new(0));
    manager.start().await;
    manager.pool().register(counted_resource("feed", &cleaned)).unwrap();

    manager.on_memory(MemoryReading::new(75, 100));
    settle().await;

    assert_eq!(manager.stats().count("memory-warning"), 1);
    assert_eq!(manager.stats().count("gc-started"), 0);
    assert!(manager.pool().contains("feed"));

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn warning_above_gc_threshold_collects() {
    let manager = manager(FixedMemory::percent(82));
    let cleaned = Arc::new(AtomicUsize::new(0));
    manager.start().await;
    manager.pool().register(counted_resource("feed", &cleaned)).unwrap();

    manager.on_memory(MemoryReading::new(82, 100));
    settle().await;

    assert_eq!(manager.stats().count("memory-warning"), 1);
    assert_eq!(manager.stats().count("memory-critical"), 0);
    assert_eq!(manager.stats().count("gc-completed"), 1);
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert!(!manager.pool().contains("feed"));

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn signals_fan_out_to_every_controller() {
    let manager = manager(FixedMemory::percent(40));
    manager.start().await;

    let low = BatteryStatus::new(15.0, false).unwrap();
    assert_eq!(manager.on_battery(low).await, ProfileKind::PowerSaver);
    assert_eq!(manager.sync().current_interval(), Duration::from_secs(30 * 60));

    let plugged = BatteryStatus::new(15.0, true).unwrap();
    assert_eq!(manager.on_battery(plugged).await, ProfileKind::HighPerformance);
    assert_eq!(manager.sync().current_interval(), Duration::from_secs(30));

    manager.on_app_state(AppState::Background);
    assert_eq!(manager.power().current_kind(), ProfileKind::Balanced);
    assert!(manager.monitor().is_paused());

    manager.on_network(NetworkConditions::offline());
    assert!(!manager.sync().network().is_connected());

    settle().await;
    assert_eq!(manager.stats().count("profile-changed"), 3);
    assert!(manager.stats().count("sync-interval-changed") >= 2);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polled_sources_are_read_on_start() {
    let host = host(FixedMemory::percent(40))
        .with_battery_source(Arc::new(FixedBattery(BatteryStatus::new(8.0, false).unwrap())))
        .with_network_source(Arc::new(Offline));
    let manager = AdaptiveManager::new(ManagerConfig::default(), host).unwrap();

    manager.start().await;
    assert!(manager.is_running());
    assert_eq!(manager.power().current_kind(), ProfileKind::UltraPowerSaver);
    assert!(!manager.sync().network().is_connected());

    manager.stop().await;
    assert!(!manager.is_running());
}

#[tokio::test(start_paused = true)]
async fn stop_releases_pooled_resources() {
    let manager = manager(FixedMemory::percent(40));
    let cleaned = Arc::new(AtomicUsize::new(0));
    manager.start().await;
    manager.pool().register(counted_resource("a", &cleaned)).unwrap();
    manager.pool().register(counted_resource("b", &cleaned)).unwrap();
    manager.pool().acquire("b");

    manager.stop().await;

    assert_eq!(cleaned.load(Ordering::SeqCst), 2);
    assert!(manager.pool().is_empty());
}

#[derive(Default)]
struct CountingPages {
    calls: AtomicUsize,
}

#[async_trait]
impl PageLoader<u32> for CountingPages {
    async fn load_page(&self, page: u32, size: u32) -> Result<PageData<u32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = (page - 1) * size;
        Ok(PageData::new((start..start + size).collect(), 1_000))
    }
}

#[tokio::test(start_paused = true)]
async fn power_saving_profile_stops_prefetching() {
    let manager = manager(FixedMemory::percent(40));
    manager.start().await;
    let pages = Arc::new(CountingPages::default());
    let cache = manager.paginated_cache(pages.clone()).unwrap();
    let loader = manager.lazy_loader::<String>().unwrap();
    loader
        .register(LoadableItem::with_loader("banner", ItemKind::Image, || async {
            Ok("banner".to_string())
        }))
        .unwrap();
    assert!(manager.prefetch_gate().is_enabled());

    manager.power().set_profile_by_name("ultra-power-saver").unwrap();
    settle().await;
    assert!(!manager.prefetch_gate().is_enabled());

    cache.get_page(3).await.unwrap();
    cache.get_page(3).await.unwrap();
    settle().await;
    assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().prefetches, 0);

    let preloaded = loader.preload(&["banner"]).await;
    assert!(matches!(preloaded.as_slice(), [Err(Error::FeatureDisabled { .. })]));

    manager.power().set_profile_by_name("balanced").unwrap();
    settle().await;
    assert!(manager.prefetch_gate().is_enabled());
    cache.get_page(3).await.unwrap();
    settle().await;
    assert!(pages.calls.load(Ordering::SeqCst) > 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn factories_use_configured_defaults() {
    let config = ManagerConfig::from_json_str(
        r#"{
            "pages": { "page_size": 10, "min_page_size": 5, "adaptive_page_size": false },
            "windows": { "mode": { "type": "tumbling", "size": 2 }, "max_windows": 4 }
        }"#,
    )
    .unwrap();
    let manager = AdaptiveManager::new(config, host(FixedMemory::percent(40))).unwrap();

    struct Numbers;

    #[async_trait]
    impl PageLoader<u32> for Numbers {
        async fn load_page(&self, page: u32, size: u32) -> Result<PageData<u32>> {
            let start = (page - 1) * size;
            Ok(PageData::new((start..start + size).collect(), 100))
        }
    }

    let cache = manager.paginated_cache(Arc::new(Numbers)).unwrap();
    assert_eq!(cache.page_size(), 10);
    assert_eq!(cache.get_page(2).await.unwrap().items.first(), Some(&10));

    let mut aggregator = manager.aggregator::<u8>().unwrap();
    aggregator.extend(0..10);
    assert_eq!(aggregator.windows().len(), 4);

    let loader = manager.lazy_loader::<String>().unwrap();
    loader
        .register(LoadableItem::with_loader("motd", ItemKind::Data, || async {
            Ok("hello".to_string())
        }))
        .unwrap();
    assert_eq!(loader.get_item("motd").await.unwrap(), "hello");
}
