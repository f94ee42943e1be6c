//! Lazy loader scenarios with scripted item loaders

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use lowtide_cache::{
    ItemKind, LazyResourceLoader, LoadStatus, LoadableItem, LoaderConfig, LoaderEvent,
    PrefetchGate, UrlFetcher,
};
use lowtide_core::{Error, ErrorKind, Result, Signal};

#[derive(Default)]
struct Tally {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl Tally {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn ok_item(tally: &Arc<Tally>, id: &str, latency: Duration) -> LoadableItem<String> {
    let tally = Arc::clone(tally);
    let name = id.to_owned();
    LoadableItem::with_loader(id, ItemKind::Data, move || {
        let tally = Arc::clone(&tally);
        let name = name.clone();
        async move {
            tally.calls.fetch_add(1, Ordering::SeqCst);
            tally.order.lock().push(name.clone());
            let now = tally.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            tally.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            tally.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("{name}-data"))
        }
    })
}

fn failing_item(tally: &Arc<Tally>, id: &str) -> LoadableItem<String> {
    let tally = Arc::clone(tally);
    LoadableItem::with_loader(id, ItemKind::Image, move || {
        let tally = Arc::clone(&tally);
        async move {
            tally.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("decode", "corrupt image"))
        }
    })
}

fn loader(config: LoaderConfig) -> Arc<LazyResourceLoader<String>> {
    Arc::new(LazyResourceLoader::new(config).unwrap())
}

#[tokio::test(start_paused = true)]
async fn failing_item_stops_after_retry_attempts() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    let mut rx = loader.subscribe();
    loader.register(failing_item(&tally, "hero")).unwrap();

    let started = Instant::now();
    let err = loader.get_item("hero").await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(tally.calls(), 3);
    assert!(matches!(err, Error::LoadFailed { attempts: 3, .. }));
    // 1s after the first failure, 2s after the second
    assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));

    let state = loader.state("hero").unwrap();
    assert_eq!(state.status, LoadStatus::Error);
    assert_eq!(state.attempts, 3);

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["item-error"]);

    // stays failed without touching the loader again
    assert!(loader.get_item("hero").await.is_err());
    assert_eq!(tally.calls(), 3);

    assert!(loader.retry("hero"));
    assert_eq!(loader.state("hero").unwrap().status, LoadStatus::Pending);
    assert!(loader.get_item("hero").await.is_err());
    assert_eq!(tally.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_load() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    loader
        .register(ok_item(&tally, "avatar", Duration::from_millis(100)))
        .unwrap();

    let results = futures::future::join_all((0..10).map(|_| loader.get_item("avatar"))).await;

    assert_eq!(tally.calls(), 1);
    assert!(results.iter().all(|r| r.as_deref() == Ok("avatar-data")));
    assert_eq!(loader.state("avatar").unwrap().data.as_deref(), Some("avatar-data"));
}

#[tokio::test(start_paused = true)]
async fn dependencies_load_first() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    loader
        .register(ok_item(&tally, "screen", Duration::ZERO).depends_on("widgets"))
        .unwrap();
    loader
        .register(ok_item(&tally, "widgets", Duration::ZERO).depends_on("runtime"))
        .unwrap();
    loader.register(ok_item(&tally, "runtime", Duration::ZERO)).unwrap();

    assert_eq!(loader.get_item("screen").await.unwrap(), "screen-data");
    assert_eq!(*tally.order.lock(), vec!["runtime", "widgets", "screen"]);
}

#[tokio::test(start_paused = true)]
async fn failed_dependency_fails_dependent() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig {
        retry_attempts: 1,
        ..LoaderConfig::default()
    });
    loader.register(failing_item(&tally, "font")).unwrap();
    loader
        .register(ok_item(&tally, "label", Duration::ZERO).depends_on("font"))
        .unwrap();

    assert!(loader.get_item("label").await.is_err());
    assert_eq!(loader.state("label").unwrap().status, LoadStatus::Error);
    assert_eq!(loader.state("font").unwrap().status, LoadStatus::Error);
    assert!(tally.order.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cache_evicts_oldest_insertion() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig {
        cache_size: 2,
        ..LoaderConfig::default()
    });
    let mut rx = loader.subscribe();
    for id in ["a", "b", "c"] {
        loader.register(ok_item(&tally, id, Duration::ZERO)).unwrap();
        loader.get_item(id).await.unwrap();
    }

    assert_eq!(loader.cached_ids(), vec!["b", "c"]);
    assert_eq!(loader.state("a").unwrap().status, LoadStatus::Pending);
    assert_eq!(loader.state("a").unwrap().data, None);

    let mut evicted = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LoaderEvent::Evicted { id } = event {
            evicted.push(id);
        }
    }
    assert_eq!(evicted, vec!["a".to_string()]);

    // an evicted item loads again on demand
    loader.get_item("a").await.unwrap();
    assert_eq!(tally.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn batches_respect_concurrency_and_visibility() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    for (id, priority) in [("a", 1), ("b", 5), ("c", 3), ("d", 0), ("e", 2)] {
        loader
            .register(ok_item(&tally, id, Duration::from_millis(50)).with_priority(priority))
            .unwrap();
    }
    loader.set_visible("d", true);

    let first = loader.process_batch().await;
    assert_eq!(first.loaded, 3);
    let mut order = tally.order.lock().clone();
    order.sort();
    assert_eq!(order, vec!["b", "c", "d"]);
    assert_eq!(loader.queued_ids(), vec!["e", "a"]);

    let second = loader.process_batch().await;
    assert_eq!(second.loaded, 2);
    assert_eq!(tally.max_in_flight.load(Ordering::SeqCst), 3);
    assert!(loader.queued_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn preload_is_bounded_by_the_semaphore() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    let ids = ["p1", "p2", "p3", "p4", "p5", "p6"];
    for id in ids {
        loader
            .register(ok_item(&tally, id, Duration::from_millis(100)))
            .unwrap();
    }

    let results = loader.preload(&ids).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(tally.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn preload_is_refused_while_prefetch_is_disabled() {
    let tally = Arc::new(Tally::default());
    let gate = PrefetchGate::with_enabled(false);
    let loader = Arc::new(
        LazyResourceLoader::new(LoaderConfig::default())
            .unwrap()
            .with_prefetch_gate(gate.clone()),
    );
    loader.register(ok_item(&tally, "cover", Duration::ZERO)).unwrap();

    let results = loader.preload(&["cover"]).await;
    assert!(matches!(
        results.as_slice(),
        [Err(Error::FeatureDisabled { feature })] if feature == "prefetch"
    ));
    assert_eq!(tally.calls(), 0);

    // on-demand reads are not speculative and still load
    assert_eq!(loader.get_item("cover").await.unwrap(), "cover-data");

    gate.set_enabled(true);
    assert!(loader.preload(&["cover"]).await.iter().all(Result::is_ok));
}

struct Cdn;

#[async_trait]
impl UrlFetcher<String> for Cdn {
    async fn fetch(&self, url: &str, kind: ItemKind) -> Result<String> {
        Ok(format!("{kind:?}:{url}"))
    }
}

#[tokio::test(start_paused = true)]
async fn url_items_go_through_the_fetcher() {
    let loader = Arc::new(
        LazyResourceLoader::new(LoaderConfig::default())
            .unwrap()
            .with_url_fetcher(Arc::new(Cdn)),
    );
    loader
        .register(LoadableItem::url("logo", ItemKind::Image, "https://cdn/logo.png"))
        .unwrap();

    assert_eq!(
        loader.get_item("logo").await.unwrap(),
        "Image:https://cdn/logo.png"
    );
    assert!(matches!(
        loader.get_item("missing").await,
        Err(Error::InvalidArgument { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_retry_sleep() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig {
        retry_delay: Duration::from_secs(60),
        ..LoaderConfig::default()
    });
    loader.register(failing_item(&tally, "slow")).unwrap();

    let pending = {
        let loader = Arc::clone(&loader);
        tokio::spawn(async move { loader.get_item("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    loader.shutdown();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(tally.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn ticker_drains_the_queue() {
    let tally = Arc::new(Tally::default());
    let loader = loader(LoaderConfig::default());
    loader.register(ok_item(&tally, "x", Duration::ZERO)).unwrap();
    loader.register(ok_item(&tally, "y", Duration::ZERO)).unwrap();

    loader.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    loader.shutdown();

    assert_eq!(loader.cached_ids().len(), 2);
    assert_eq!(tally.calls(), 2);
}
