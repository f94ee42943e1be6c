//! Memory pressure monitoring, leak heuristics and cleanup fan-out.
//!
//! The [`MemoryPressureMonitor`] keeps a bounded history of
//! [`PressureSample`]s, classifies each one against ascending thresholds and
//! emits at most one pressure event per sample. Cleanup callbacks registered
//! by other components are run concurrently by
//! [`force_cleanup`](MemoryPressureMonitor::force_cleanup); a failing or
//! panicking callback never blocks the others.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lowtide_core::{AppState, Error, EventBus, Result, Signal, spawn_periodic};

use crate::source::{MemoryReading, MemorySource};

/// Async cleanup hook registered with the monitor.
pub type CleanupCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Samples and levels
// ---------------------------------------------------------------------------

/// One timestamped memory-usage observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSample {
    /// Bytes in use
    pub used_bytes: u64,
    /// Total bytes
    pub total_bytes: u64,
    /// `used / total * 100`, always within `0.0..=100.0`
    pub percent_used: f64,
    /// Monotonic timestamp of the observation
    pub timestamp: Instant,
}

impl PressureSample {
    fn from_reading(reading: MemoryReading) -> Self {
        Self {
            used_bytes: reading.used_bytes,
            total_bytes: reading.total_bytes,
            percent_used: reading.percent_used(),
            timestamp: Instant::now(),
        }
    }
}

/// Pressure classification of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Below the warning threshold
    Normal,
    /// At or above the warning threshold
    Warning,
    /// At or above the critical threshold
    Critical,
    /// At or above the out-of-memory threshold
    Oom,
}

impl PressureLevel {
    /// Check if pressure requires action (Critical or Oom)
    #[must_use]
    pub fn is_critical(self) -> bool {
        self >= Self::Critical
    }
}

/// Ascending pressure thresholds, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    /// Default: 70
    pub warning: f64,
    /// Default: 85
    pub critical: f64,
    /// Default: 95
    pub oom: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning: 70.0,
            critical: 85.0,
            oom: 95.0,
        }
    }
}

impl PressureThresholds {
    /// Classify a usage percentage. The highest crossed threshold wins.
    #[must_use]
    pub fn classify(&self, percent: f64) -> PressureLevel {
        if percent >= self.oom {
            PressureLevel::Oom
        } else if percent >= self.critical {
            PressureLevel::Critical
        } else if percent >= self.warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Validate that thresholds are ascending and within `(0, 100]`.
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !(in_range(self.warning) && in_range(self.critical) && in_range(self.oom)) {
            return Err(Error::configuration("pressure thresholds must be in (0, 100]"));
        }
        if !(self.warning < self.critical && self.critical < self.oom) {
            return Err(Error::configuration(
                "pressure thresholds must satisfy warning < critical < oom",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Pressure thresholds
    pub thresholds: PressureThresholds,
    /// Ring-buffer capacity of the sample history. Default: 100
    pub history_size: usize,
    /// Period of the background sampler. Default: 5s
    #[serde(with = "lowtide_core::serde_ms")]
    pub sample_interval: Duration,
    /// Number of trailing samples inspected by the growth heuristic. Default: 20
    pub leak_window: usize,
    /// Share of increasing steps that flags a leak. Default: 0.8
    pub leak_increase_ratio: f64,
    /// Relative single-sample drop recognised as a cleanup. Default: 0.1
    pub cleanup_drop_ratio: f64,
    /// Samples after a cleanup drop before recovery is judged. Default: 5
    pub recovery_samples: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: PressureThresholds::default(),
            history_size: 100,
            sample_interval: Duration::from_secs(5),
            leak_window: 20,
            leak_increase_ratio: 0.8,
            cleanup_drop_ratio: 0.1,
            recovery_samples: 5,
        }
    }
}

impl MonitorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.history_size == 0 {
            return Err(Error::configuration("history_size must be > 0"));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::configuration("sample_interval must be greater than zero"));
        }
        if self.leak_window < 2 || self.leak_window > self.history_size {
            return Err(Error::configuration(
                "leak_window must be in 2..=history_size",
            ));
        }
        if !(0.0..=1.0).contains(&self.leak_increase_ratio) {
            return Err(Error::configuration("leak_increase_ratio must be in [0, 1]"));
        }
        if !(self.cleanup_drop_ratio > 0.0 && self.cleanup_drop_ratio < 1.0) {
            return Err(Error::configuration("cleanup_drop_ratio must be in (0, 1)"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reports and events
// ---------------------------------------------------------------------------

/// Outcome of [`MemoryPressureMonitor::force_cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Callbacks that resolved `Ok`
    pub succeeded: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
    /// Whether the platform accepted a GC hint afterwards
    pub gc_requested: bool,
}

/// Outcome of [`MemoryPressureMonitor::detect_leak`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    /// Whether either heuristic fired
    pub has_leak: bool,
    /// Confidence in `0.0..=1.0`
    pub confidence: f64,
    /// Human-readable explanation
    pub reason: String,
}

impl LeakReport {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            has_leak: false,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEvent {
    /// Usage crossed the warning threshold
    Warning(PressureSample),
    /// Usage crossed the critical threshold
    Critical(PressureSample),
    /// Usage crossed the out-of-memory threshold
    Oom(PressureSample),
    /// A forced cleanup finished
    Cleanup(CleanupReport),
    /// The leak heuristics fired
    LeakSuspected(LeakReport),
}

impl Signal for MemoryEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Warning(_) => "memory-warning",
            Self::Critical(_) => "memory-critical",
            Self::Oom(_) => "memory-oom",
            Self::Cleanup(_) => "memory-cleanup",
            Self::LeakSuspected(_) => "memory-leak-suspected",
        }
    }
}

// ---------------------------------------------------------------------------
// PressureProbe
// ---------------------------------------------------------------------------

/// Non-recording view of current memory pressure.
///
/// Consumers such as the resource pool poll this between cleanups to decide
/// whether to keep going.
pub trait PressureProbe: Send + Sync {
    /// Current usage in percent, or `None` when no reading is available.
    fn current_percent(&self) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// MemoryPressureMonitor
// ---------------------------------------------------------------------------

/// Samples memory usage, classifies pressure and coordinates cleanup.
pub struct MemoryPressureMonitor {
    config: MonitorConfig,
    source: Arc<dyn MemorySource>,
    history: Mutex<VecDeque<PressureSample>>,
    callbacks: RwLock<Vec<(String, CleanupCallback)>>,
    paused: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventBus<MemoryEvent>,
}

impl MemoryPressureMonitor {
    /// Create a monitor over `source`.
    pub fn new(config: MonitorConfig, source: Arc<dyn MemorySource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            source,
            callbacks: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
            cancel: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Monitor configuration.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Subscribe to monitor events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Read the source and record the result.
    ///
    /// A failed read is logged and skipped; `None` is returned and the
    /// history is left untouched.
    pub fn sample(&self) -> Option<PressureSample> {
        match self.source.read() {
            Ok(reading) => Some(self.record(reading)),
            Err(e) => {
                tracing::warn!(error = %e, "memory sample skipped");
                None
            }
        }
    }

    /// Record a reading pushed by the host.
    pub fn record(&self, reading: MemoryReading) -> PressureSample {
        let sample = PressureSample::from_reading(reading);
        {
            let mut history = self.history.lock();
            if history.len() == self.config.history_size {
                history.pop_front();
            }
            history.push_back(sample);
        }

        match self.config.thresholds.classify(sample.percent_used) {
            PressureLevel::Normal => {}
            PressureLevel::Warning => {
                tracing::debug!(percent = sample.percent_used, "memory warning");
                self.events.emit(MemoryEvent::Warning(sample));
            }
            PressureLevel::Critical => {
                tracing::warn!(percent = sample.percent_used, "memory critical");
                self.events.emit(MemoryEvent::Critical(sample));
            }
            PressureLevel::Oom => {
                tracing::error!(percent = sample.percent_used, "memory near exhaustion");
                self.events.emit(MemoryEvent::Oom(sample));
            }
        }
        sample
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<PressureSample> {
        self.history.lock().back().copied()
    }

    /// Pressure level of the most recent sample.
    #[must_use]
    pub fn current_level(&self) -> PressureLevel {
        self.latest().map_or(PressureLevel::Normal, |s| {
            self.config.thresholds.classify(s.percent_used)
        })
    }

    /// Snapshot of the sample history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PressureSample> {
        self.history.lock().iter().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Cleanup callbacks
    // -----------------------------------------------------------------------

    /// Register a named cleanup callback.
    ///
    /// Registering the same name twice keeps the first callback and returns
    /// `false`.
    pub fn register_cleanup_callback(
        &self,
        name: impl Into<String>,
        callback: CleanupCallback,
    ) -> bool {
        let name = name.into();
        let mut callbacks = self.callbacks.write();
        if callbacks.iter().any(|(existing, _)| *existing == name) {
            return false;
        }
        tracing::debug!(callback = %name, "cleanup callback registered");
        callbacks.push((name, callback));
        true
    }

    /// Remove a cleanup callback. Returns whether it existed.
    pub fn unregister_cleanup_callback(&self, name: &str) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| existing != name);
        callbacks.len() != before
    }

    /// Number of registered cleanup callbacks.
    #[must_use]
    pub fn cleanup_callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Run every cleanup callback concurrently, then request a platform GC.
    pub async fn force_cleanup(&self) -> CleanupReport {
        let callbacks: Vec<(String, CleanupCallback)> = self.callbacks.read().clone();

        let runs = callbacks.into_iter().map(|(name, callback)| async move {
            let outcome = AssertUnwindSafe(async move { callback().await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(callback = %name, error = %e, "cleanup callback failed");
                    false
                }
                Err(_) => {
                    tracing::error!(callback = %name, "cleanup callback panicked");
                    false
                }
            }
        });
        let results = join_all(runs).await;

        let succeeded = results.iter().filter(|ok| **ok).count();
        let report = CleanupReport {
            succeeded,
            failed: results.len() - succeeded,
            gc_requested: self.source.request_gc(),
        };
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            gc_requested = report.gc_requested,
            "forced cleanup finished"
        );
        self.events.emit(MemoryEvent::Cleanup(report));
        report
    }

    // -----------------------------------------------------------------------
    // Leak detection
    // -----------------------------------------------------------------------

    /// Run both leak heuristics over the recorded history.
    ///
    /// The growth heuristic fires when at least `leak_increase_ratio` of the
    /// steps in the last `leak_window` samples increase. The recovery
    /// heuristic fires when usage after the most recent cleanup-sized drop has
    /// climbed back to the pre-drop level within `recovery_samples` or more
    /// samples. The reported confidence is the higher of the two.
    pub fn detect_leak(&self) -> LeakReport {
        let used: Vec<u64> = self.history.lock().iter().map(|s| s.used_bytes).collect();

        let growth = self.growth_heuristic(&used);
        let recovery = self.recovery_heuristic(&used);

        let report = match (growth, recovery) {
            (Some(a), Some(b)) if b.confidence > a.confidence => b,
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => return LeakReport::none("no leak pattern in sample history"),
        };

        tracing::warn!(
            confidence = report.confidence,
            reason = %report.reason,
            "memory leak suspected"
        );
        self.events.emit(MemoryEvent::LeakSuspected(report.clone()));
        report
    }

    fn growth_heuristic(&self, used: &[u64]) -> Option<LeakReport> {
        let window = self.config.leak_window;
        if used.len() < window {
            return None;
        }
        let tail = &used[used.len() - window..];
        let steps = tail.len() - 1;
        let increases = tail.windows(2).filter(|w| w[1] > w[0]).count();
        let ratio = increases as f64 / steps as f64;

        (ratio >= self.config.leak_increase_ratio).then(|| LeakReport {
            has_leak: true,
            confidence: ratio,
            reason: format!("{increases} of the last {steps} samples increased"),
        })
    }

    fn recovery_heuristic(&self, used: &[u64]) -> Option<LeakReport> {
        let drop_factor = 1.0 - self.config.cleanup_drop_ratio;
        let drop_at = (1..used.len())
            .rev()
            .find(|&i| (used[i] as f64) < used[i - 1] as f64 * drop_factor)?;

        let before = used[drop_at - 1];
        let after = used.len() - 1 - drop_at;
        let latest = *used.last()?;
        (after >= self.config.recovery_samples && latest >= before).then(|| LeakReport {
            has_leak: true,
            confidence: 0.7,
            reason: format!(
                "usage returned to {latest} bytes after cleanup from {before} bytes \
                 ({after} samples later)"
            ),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Pause sampling in the background and resume in the foreground.
    pub fn set_app_state(&self, state: AppState) {
        let paused = !state.is_foreground();
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            tracing::debug!(paused, "memory monitor pause state changed");
        }
    }

    /// Whether the background sampler is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Start the periodic sampler. Calling `start` twice restarts it.
    pub fn start(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let monitor = Arc::clone(self);
        spawn_periodic(
            "memory-monitor",
            self.config.sample_interval,
            cancel,
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    if !monitor.is_paused() {
                        monitor.sample();
                    }
                }
            },
        );
    }

    /// Stop the periodic sampler.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

impl PressureProbe for MemoryPressureMonitor {
    fn current_percent(&self) -> Option<f64> {
        match self.source.read() {
            Ok(reading) => Some(reading.percent_used()),
            Err(e) => {
                tracing::debug!(error = %e, "pressure probe fell back to last sample");
                self.latest().map(|s| s.percent_used)
            }
        }
    }
}

impl std::fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("config", &self.config)
            .field("samples", &self.history.lock().len())
            .field("callbacks", &self.callbacks.read().len())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryPressureMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Fixed(MemoryReading);

    impl MemorySource for Fixed {
        fn read(&self) -> Result<MemoryReading> {
            Ok(self.0)
        }
    }

    struct Failing;

    impl MemorySource for Failing {
        fn read(&self) -> Result<MemoryReading> {
            Err(Error::sampling("test", "unavailable"))
        }
    }

    fn monitor(source: Arc<dyn MemorySource>) -> MemoryPressureMonitor {
        MemoryPressureMonitor::new(MonitorConfig::default(), source).unwrap()
    }

    fn callback<F, Fut>(f: F) -> CleanupCallback
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Arc::new(move || f().boxed())
    }

    #[test]
    fn classify_prefers_highest_threshold() {
        let t = PressureThresholds::default();
        assert_eq!(t.classify(10.0), PressureLevel::Normal);
        assert_eq!(t.classify(70.0), PressureLevel::Warning);
        assert_eq!(t.classify(90.0), PressureLevel::Critical);
        assert_eq!(t.classify(99.0), PressureLevel::Oom);
    }

    #[test]
    fn thresholds_must_ascend() {
        let t = PressureThresholds {
            warning: 90.0,
            critical: 85.0,
            oom: 95.0,
        };
        assert!(t.validate().is_err());
    }

    #[tokio::test]
    async fn one_event_per_sample_with_oom_precedence() {
        let m = monitor(Arc::new(Fixed(MemoryReading::new(97, 100))));
        let mut rx = m.subscribe();
        m.sample();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "memory-oom");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_sample_is_skipped() {
        let m = monitor(Arc::new(Failing));
        assert!(m.sample().is_none());
        assert!(m.history().is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let config = MonitorConfig {
            history_size: 20,
            ..MonitorConfig::default()
        };
        let m = MemoryPressureMonitor::new(config, Arc::new(Failing)).unwrap();
        for i in 0..50 {
            m.record(MemoryReading::new(i, 100));
        }
        let history = m.history();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].used_bytes, 30);
    }

    #[tokio::test]
    async fn cleanup_callbacks_are_idempotent_by_name() {
        let m = monitor(Arc::new(Failing));
        let cb = callback(|| async { Ok(()) });
        assert!(m.register_cleanup_callback("images", Arc::clone(&cb)));
        assert!(!m.register_cleanup_callback("images", cb));
        assert_eq!(m.cleanup_callback_count(), 1);
        assert!(m.unregister_cleanup_callback("images"));
        assert!(!m.unregister_cleanup_callback("images"));
    }

    #[tokio::test]
    async fn force_cleanup_isolates_failures_and_panics() {
        let m = monitor(Arc::new(Failing));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        m.register_cleanup_callback(
            "ok",
            callback(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        m.register_cleanup_callback(
            "err",
            callback(|| async { Err(Error::cleanup("err", "disk busy")) }),
        );
        m.register_cleanup_callback(
            "panic",
            callback(|| futures::future::lazy(|_| -> Result<()> { panic!("callback bug") })),
        );

        let report = m.force_cleanup().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.gc_requested);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_drop_then_recovery_is_a_leak() {
        let m = monitor(Arc::new(Failing));
        for used in [60, 61, 62, 40, 45, 50, 55, 58, 62] {
            m.record(MemoryReading::new(used, 100));
        }
        let report = m.detect_leak();
        assert!(report.has_leak);
        assert!((report.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn flat_history_is_not_a_leak() {
        let m = monitor(Arc::new(Failing));
        for _ in 0..30 {
            m.record(MemoryReading::new(50, 100));
        }
        let report = m.detect_leak();
        assert!(!report.has_leak);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn background_pauses_sampler() {
        let m = monitor(Arc::new(Failing));
        m.set_app_state(AppState::Background);
        assert!(m.is_paused());
        m.set_app_state(AppState::Foreground);
        assert!(!m.is_paused());
    }
}
