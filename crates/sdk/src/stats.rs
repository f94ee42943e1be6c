//! Event counting across controllers.
//!
//! Counts are always kept in process. With the `metrics` feature every event
//! also increments the `lowtide.events.total` counter, labelled by signal
//! name, on whatever recorder the host installed.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lowtide_core::Signal;

/// Running count of events per signal name.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    counts: Arc<Mutex<BTreeMap<&'static str, u64>>>,
}

impl EventStats {
    /// Count one event.
    pub fn record(&self, event: &impl Signal) {
        let name = event.name();
        *self.counts.lock().entry(name).or_insert(0) += 1;
        #[cfg(feature = "metrics")]
        metrics::counter!("lowtide.events.total", "signal" => name).increment(1);
    }

    /// Events seen for `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    /// Events seen in total.
    pub fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    /// Copy of every counter, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counts.lock().clone()
    }

    /// Reset every counter.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }

    /// Count everything arriving on `receiver` until `cancel` fires or the
    /// bus is dropped.
    pub fn spawn_collector<E>(
        &self,
        receiver: broadcast::Receiver<E>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        E: Signal + Clone + Send + 'static,
    {
        let stats = self.clone();
        crate::manager::spawn_listener("event-stats", receiver, cancel, move |event: E| {
            stats.record(&event);
            async {}
        })
    }
}
