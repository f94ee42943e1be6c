//! Endpoint-keyed connection sub-pool with LRU eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lowtide_core::{Error, EventBus, Result, Signal, spawn_periodic};

/// Creates connections for an endpoint.
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    /// Open a new connection to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<C>;
}

/// A connection that can report liveness and be closed.
#[async_trait]
pub trait PooledConnection: Send + Sync + 'static {
    /// Whether the connection can still be used.
    fn is_alive(&self) -> bool {
        true
    }

    /// Release the connection.
    async fn close(&self) {}
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum open connections. Default: 10
    pub max_connections: usize,
    /// Connections unused for longer are closed by the sweep. Default: 5min
    #[serde(with = "lowtide_core::serde_ms")]
    pub idle_timeout: Duration,
    /// Period of the idle sweep. Default: 60s
    #[serde(with = "lowtide_core::serde_ms")]
    pub sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::configuration("max_connections must be > 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::configuration("sweep_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Why a connection left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Made room for a new endpoint
    Capacity,
    /// Idle longer than the timeout
    Idle,
    /// Reported itself dead
    Dead,
}

/// Events emitted by the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was closed and removed
    Evicted {
        /// The endpoint it served
        endpoint: String,
        /// Why it was removed
        reason: EvictionReason,
    },
}

impl Signal for ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Evicted { .. } => "connection-evicted",
        }
    }
}

struct Slot<C> {
    conn: Arc<C>,
    last_used: Instant,
    seq: u64,
}

struct Slots<C> {
    by_endpoint: HashMap<String, Slot<C>>,
    next_seq: u64,
}

/// Reuses one live connection per endpoint, evicting the least recently used
/// when full.
pub struct ConnectionPool<C> {
    config: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    slots: Mutex<Slots<C>>,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventBus<ConnectionEvent>,
}

impl<C: PooledConnection> ConnectionPool<C> {
    /// Create an empty pool.
    pub fn new(config: ConnectionConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            slots: Mutex::new(Slots {
                by_endpoint: HashMap::new(),
                next_seq: 0,
            }),
            cancel: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().by_endpoint.len()
    }

    /// Whether no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a connection for `endpoint` is pooled.
    #[must_use]
    pub fn contains(&self, endpoint: &str) -> bool {
        self.slots.lock().by_endpoint.contains_key(endpoint)
    }

    /// Return the live connection for `endpoint`, opening one if needed.
    pub async fn get_connection(&self, endpoint: &str) -> Result<Arc<C>> {
        let dead = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots
                .by_endpoint
                .get_mut(endpoint)
                .filter(|slot| slot.conn.is_alive())
            {
                slot.last_used = Instant::now();
                return Ok(Arc::clone(&slot.conn));
            }
            slots.by_endpoint.remove(endpoint)
        };
        if let Some(slot) = dead {
            self.close(endpoint, slot, EvictionReason::Dead).await;
        }

        let conn = Arc::new(self.factory.connect(endpoint).await?);

        let (result, evicted, duplicate) = {
            let mut slots = self.slots.lock();
            if let Some(existing) = slots
                .by_endpoint
                .get_mut(endpoint)
                .filter(|slot| slot.conn.is_alive())
            {
                // Another caller connected while we were awaiting the factory.
                existing.last_used = Instant::now();
                (Arc::clone(&existing.conn), None, Some(conn))
            } else {
                let evicted = if slots.by_endpoint.len() >= self.config.max_connections {
                    slots
                        .by_endpoint
                        .iter()
                        .min_by_key(|(_, slot)| (slot.last_used, slot.seq))
                        .map(|(key, _)| key.clone())
                        .and_then(|key| slots.by_endpoint.remove(&key).map(|s| (key, s)))
                } else {
                    None
                };
                let seq = slots.next_seq;
                slots.next_seq += 1;
                slots.by_endpoint.insert(
                    endpoint.to_string(),
                    Slot {
                        conn: Arc::clone(&conn),
                        last_used: Instant::now(),
                        seq,
                    },
                );
                (conn, evicted, None)
            }
        };

        if let Some(conn) = duplicate {
            conn.close().await;
        }
        if let Some((key, slot)) = evicted {
            self.close(&key, slot, EvictionReason::Capacity).await;
        }
        Ok(result)
    }

    /// Close connections idle longer than `idle_timeout`.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Slot<C>)> = {
            let mut slots = self.slots.lock();
            let keys: Vec<String> = slots
                .by_endpoint
                .iter()
                .filter(|(_, slot)| now.duration_since(slot.last_used) > self.config.idle_timeout)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| slots.by_endpoint.remove(&key).map(|s| (key, s)))
                .collect()
        };

        let count = expired.len();
        for (key, slot) in expired {
            self.close(&key, slot, EvictionReason::Idle).await;
        }
        count
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let all: Vec<(String, Slot<C>)> = self.slots.lock().by_endpoint.drain().collect();
        for (_, slot) in all {
            slot.conn.close().await;
        }
    }

    async fn close(&self, endpoint: &str, slot: Slot<C>, reason: EvictionReason) {
        tracing::debug!(endpoint, ?reason, "closing pooled connection");
        slot.conn.close().await;
        self.events.emit(ConnectionEvent::Evicted {
            endpoint: endpoint.to_string(),
            reason,
        });
    }

    /// Start the periodic idle sweep.
    pub fn start(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let pool = Arc::clone(self);
        spawn_periodic("connection-sweep", self.config.sweep_interval, cancel, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.sweep_idle().await;
            }
        });
    }

    /// Stop the sweep and close every connection.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.close_all().await;
    }
}

impl<C> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("open", &self.slots.lock().by_endpoint.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Conn {
        endpoint: String,
        alive: AtomicBool,
    }

    #[async_trait]
    impl PooledConnection for Conn {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory<Conn> for CountingFactory {
        async fn connect(&self, endpoint: &str) -> Result<Conn> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Conn {
                endpoint: endpoint.to_string(),
                alive: AtomicBool::new(true),
            })
        }
    }

    fn pool(max: usize) -> (ConnectionPool<Conn>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let config = ConnectionConfig {
            max_connections: max,
            ..ConnectionConfig::default()
        };
        let shared: Arc<dyn ConnectionFactory<Conn>> = factory.clone();
        let pool = ConnectionPool::new(config, shared).unwrap();
        (pool, factory)
    }

    #[tokio::test]
    async fn live_connection_is_reused() {
        let (pool, factory) = pool(2);
        let a = pool.get_connection("api").await.unwrap();
        let b = pool.get_connection("api").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.endpoint, "api");
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced() {
        let (pool, factory) = pool(2);
        let a = pool.get_connection("api").await.unwrap();
        a.alive.store(false, Ordering::SeqCst);
        let b = pool.get_connection("api").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_evicts_least_recently_used() {
        let (pool, _) = pool(2);
        pool.get_connection("a").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.get_connection("b").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.get_connection("a").await.unwrap();

        pool.get_connection("c").await.unwrap();
        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
        assert!(pool.contains("c"));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ties_are_broken_by_insertion_order() {
        let (pool, _) = pool(2);
        pool.get_connection("first").await.unwrap();
        pool.get_connection("second").await.unwrap();
        pool.get_connection("third").await.unwrap();
        assert!(!pool.contains("first"));
        assert!(pool.contains("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_swept() {
        let (pool, _) = pool(4);
        pool.get_connection("a").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        pool.get_connection("b").await.unwrap();
        assert_eq!(pool.sweep_idle().await, 1);
        assert!(pool.contains("b"));
        pool.close_all().await;
        assert!(pool.is_empty());
    }
}
