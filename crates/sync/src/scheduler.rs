//! Priority sync queue with condition-aware admission and resumable
//! chunked transfers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use lowtide_core::{
    AppState, Error, EventBus, NetworkConditions, NetworkSource, Result, Signal, sleep_or_cancel,
};
use lowtide_power::PowerProfileController;

use crate::policy::{QualityLevel, QualitySettings, SyncPolicy};
use crate::task::{Admission, DeferReason, PauseReason, SyncProgress, SyncTask};
use crate::transport::{Chunk, ChunkTransport, WakeLock, WakeLockGuard};

const WAKE_LOCK_TAG: &str = "lowtide-sync";

// ---------------------------------------------------------------------------
// Events and reports
// ---------------------------------------------------------------------------

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A task, or the whole run when `task_id` is `None`, was skipped
    Skipped {
        /// Skipped task
        task_id: Option<String>,
        /// Why
        reason: DeferReason,
    },
    /// A chunk transfer failed
    Error {
        /// Task id
        task_id: String,
        /// The transfer error with partial progress
        error: Error,
        /// Failed attempts so far
        attempts: u32,
        /// Whether the task stays queued
        will_retry: bool,
    },
    /// A transfer stopped between chunks and stays resumable
    Paused {
        /// Progress at the pause
        progress: SyncProgress,
        /// Why
        reason: PauseReason,
    },
    /// A task finished
    Completed {
        /// Task id
        task_id: String,
        /// Bytes moved
        bytes: u64,
    },
    /// The polling interval changed
    IntervalChanged {
        /// New interval
        interval: Duration,
    },
    /// The quality tier changed
    QualityChanged {
        /// Previous tier
        from: QualityLevel,
        /// New tier
        to: QualityLevel,
    },
}

impl Signal for SyncEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "sync-skipped",
            Self::Error { .. } => "sync-error",
            Self::Paused { .. } => "sync-paused",
            Self::Completed { .. } => "sync-completed",
            Self::IntervalChanged { .. } => "sync-interval-changed",
            Self::QualityChanged { .. } => "quality-changed",
        }
    }
}

/// Outcome of one [`NetworkSyncScheduler::process_queue`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Tasks finished and removed
    pub completed: usize,
    /// Tasks paused with progress kept
    pub paused: usize,
    /// Tasks dropped after exhausting their attempts
    pub failed: usize,
    /// Tasks moved back to the deferred set
    pub deferred: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Entry {
    task: SyncTask,
    transferred: u64,
    attempts: u32,
}

impl Entry {
    fn new(task: SyncTask) -> Self {
        Self {
            task,
            transferred: 0,
            attempts: 0,
        }
    }

    fn progress(&self) -> SyncProgress {
        SyncProgress {
            task_id: self.task.id.clone(),
            transferred: self.transferred,
            total: self.task.size_bytes,
        }
    }
}

enum Transfer {
    Completed,
    Paused(PauseReason),
    Failed(Error),
}

#[derive(Debug, Clone, Copy)]
struct Conditions {
    network: NetworkConditions,
    app: AppState,
}

/// Clears the processing flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// NetworkSyncScheduler
// ---------------------------------------------------------------------------

/// Decides when and how much to sync from battery, network and profile.
pub struct NetworkSyncScheduler {
    policy: SyncPolicy,
    power: Arc<PowerProfileController>,
    transport: Arc<dyn ChunkTransport>,
    wake_lock: Arc<dyn WakeLock>,
    conditions: RwLock<Conditions>,
    queue: Mutex<Vec<Entry>>,
    deferred: Mutex<Vec<(Entry, DeferReason)>>,
    processing: AtomicBool,
    last_reported: Mutex<Option<(Duration, QualityLevel)>>,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventBus<SyncEvent>,
}

impl NetworkSyncScheduler {
    /// Create a scheduler reading battery and profile from `power`.
    pub fn new(
        policy: SyncPolicy,
        power: Arc<PowerProfileController>,
        transport: Arc<dyn ChunkTransport>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            power,
            transport,
            wake_lock,
            conditions: RwLock::new(Conditions {
                network: NetworkConditions::default(),
                app: AppState::Foreground,
            }),
            queue: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            last_reported: Mutex::new(None),
            cancel: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Scheduler policy.
    #[must_use]
    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Subscribe to scheduler events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Last network conditions seen.
    #[must_use]
    pub fn network(&self) -> NetworkConditions {
        self.conditions.read().network
    }

    // -----------------------------------------------------------------------
    // Policy views
    // -----------------------------------------------------------------------

    /// Polling interval for the current conditions.
    #[must_use]
    pub fn current_interval(&self) -> Duration {
        let network = self.network();
        self.policy
            .interval(self.power.battery(), &network, &self.power.current_profile())
    }

    /// Quality settings for the current conditions.
    #[must_use]
    pub fn current_quality(&self) -> QualitySettings {
        let network = self.network();
        QualitySettings::preset(self.policy.quality(
            self.power.battery(),
            &network,
            &self.power.current_profile(),
        ))
    }

    /// Recompute interval and quality, emitting events for whatever changed.
    pub fn refresh(&self) -> (Duration, QualitySettings) {
        let interval = self.current_interval();
        let quality = self.current_quality();

        let previous = self.last_reported.lock().replace((interval, quality.level));
        let (old_interval, old_level) = previous.unwrap_or((Duration::ZERO, quality.level));
        if old_interval != interval {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "sync interval changed");
            self.events.emit(SyncEvent::IntervalChanged { interval });
        }
        if old_level != quality.level {
            tracing::debug!(from = ?old_level, to = ?quality.level, "sync quality changed");
            self.events.emit(SyncEvent::QualityChanged {
                from: old_level,
                to: quality.level,
            });
        }
        (interval, quality)
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Record new network conditions and re-admit deferred tasks.
    pub fn update_network(&self, network: NetworkConditions) {
        self.conditions.write().network = network;
        self.readmit();
        self.refresh();
    }

    /// Record a foreground/background transition and re-admit deferred tasks.
    pub fn set_app_state(&self, app: AppState) {
        self.conditions.write().app = app;
        self.readmit();
    }

    fn readmit(&self) -> usize {
        let conditions = *self.conditions.read();
        let admitted: Vec<Entry> = {
            let mut deferred = self.deferred.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = deferred
                .drain(..)
                .partition(|(e, _)| {
                    e.task
                        .admission(&conditions.network, conditions.app)
                        .is_none()
                });
            *deferred = waiting;
            ready.into_iter().map(|(e, _)| e).collect()
        };

        let count = admitted.len();
        if count > 0 {
            let mut queue = self.queue.lock();
            for entry in admitted {
                insert_by_priority(&mut queue, entry);
            }
            tracing::debug!(count, "deferred sync tasks re-admitted");
        }
        count
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Admit a task to the queue, or defer it if current conditions forbid it.
    pub fn enqueue(&self, task: SyncTask) -> Result<Admission> {
        if self.contains(&task.id) {
            return Err(Error::invalid_argument(
                "id",
                format!("sync task '{}' is already scheduled", task.id),
            ));
        }

        let conditions = *self.conditions.read();
        match task.admission(&conditions.network, conditions.app) {
            Some(reason) => {
                tracing::debug!(task_id = %task.id, %reason, "sync task deferred");
                self.events.emit(SyncEvent::Skipped {
                    task_id: Some(task.id.clone()),
                    reason,
                });
                self.deferred.lock().push((Entry::new(task), reason));
                Ok(Admission::Deferred(reason))
            }
            None => {
                insert_by_priority(&mut self.queue.lock(), Entry::new(task));
                Ok(Admission::Queued)
            }
        }
    }

    /// Remove a queued or deferred task. Returns whether it was scheduled.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|e| e.task.id != id);
        if queue.len() != before {
            return true;
        }
        drop(queue);
        let mut deferred = self.deferred.lock();
        let before = deferred.len();
        deferred.retain(|(e, _)| e.task.id != id);
        deferred.len() != before
    }

    fn contains(&self, id: &str) -> bool {
        self.queue.lock().iter().any(|e| e.task.id == id)
            || self.deferred.lock().iter().any(|(e, _)| e.task.id == id)
    }

    /// Ids in run order.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.queue.lock().iter().map(|e| e.task.id.clone()).collect()
    }

    /// Deferred ids with their reasons.
    #[must_use]
    pub fn deferred(&self) -> Vec<(String, DeferReason)> {
        self.deferred
            .lock()
            .iter()
            .map(|(e, r)| (e.task.id.clone(), *r))
            .collect()
    }

    /// Progress of a queued or deferred task.
    #[must_use]
    pub fn task_progress(&self, id: &str) -> Option<SyncProgress> {
        if let Some(entry) = self.queue.lock().iter().find(|e| e.task.id == id) {
            return Some(entry.progress());
        }
        self.deferred
            .lock()
            .iter()
            .find(|(e, _)| e.task.id == id)
            .map(|(e, _)| e.progress())
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Run queued tasks in priority order, a batch at a time.
    ///
    /// Only one run is active at once; a concurrent call returns an empty
    /// report. The wake lock is held for exactly the duration of the run.
    /// Each task is attempted at most once per run.
    pub async fn process_queue(&self) -> ProcessReport {
        let mut report = ProcessReport::default();
        let Some(_running) = RunGuard::try_acquire(&self.processing) else {
            return report;
        };

        if !self.network().is_connected() {
            self.events.emit(SyncEvent::Skipped {
                task_id: None,
                reason: DeferReason::Offline,
            });
            return report;
        }

        let _wake = WakeLockGuard::acquire(Arc::clone(&self.wake_lock), WAKE_LOCK_TAG);
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let (batch, deferred) = self.next_batch(&attempted);
            report.deferred += deferred;
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|e| e.task.id.clone()));

            let results = join_all(batch.into_iter().map(|e| self.transfer(e))).await;

            let mut halted = false;
            for (entry, outcome) in results {
                match outcome {
                    Transfer::Completed => {
                        tracing::debug!(
                            task_id = %entry.task.id,
                            bytes = entry.transferred,
                            "sync task completed"
                        );
                        self.events.emit(SyncEvent::Completed {
                            task_id: entry.task.id,
                            bytes: entry.transferred,
                        });
                        report.completed += 1;
                    }
                    Transfer::Paused(reason) => {
                        halted = true;
                        self.pause(entry, reason);
                        report.paused += 1;
                    }
                    Transfer::Failed(error) => {
                        if self.record_failure(entry, error) {
                            report.paused += 1;
                        } else {
                            report.failed += 1;
                        }
                    }
                }
            }
            if halted {
                break;
            }
        }

        if report != ProcessReport::default() {
            tracing::info!(
                completed = report.completed,
                paused = report.paused,
                failed = report.failed,
                deferred = report.deferred,
                "sync queue processed"
            );
        }
        report
    }

    /// Take up to the concurrency limit of runnable entries off the queue,
    /// moving entries that current conditions forbid to the deferred set.
    fn next_batch(&self, attempted: &HashSet<String>) -> (Vec<Entry>, usize) {
        let conditions = *self.conditions.read();
        let limit = self.policy.concurrency(&conditions.network);

        let mut batch = Vec::with_capacity(limit);
        let mut moved = Vec::new();
        {
            let mut queue = self.queue.lock();
            let mut i = 0;
            while i < queue.len() && batch.len() < limit {
                if attempted.contains(&queue[i].task.id) {
                    i += 1;
                } else if let Some(reason) =
                    queue[i].task.admission(&conditions.network, conditions.app)
                {
                    moved.push((queue.remove(i), reason));
                } else {
                    batch.push(queue.remove(i));
                }
            }
        }

        let deferred = moved.len();
        for (entry, reason) in moved {
            self.events.emit(SyncEvent::Skipped {
                task_id: Some(entry.task.id.clone()),
                reason,
            });
            self.deferred.lock().push((entry, reason));
        }
        (batch, deferred)
    }

    async fn transfer(&self, mut entry: Entry) -> (Entry, Transfer) {
        let total = entry.task.size_bytes;
        while entry.transferred < total {
            if let Some(reason) = self.continuation_blocker() {
                return (entry, Transfer::Paused(reason));
            }

            let chunk = Chunk {
                task_id: entry.task.id.clone(),
                direction: entry.task.direction,
                offset: entry.transferred,
                len: self.policy.chunk_size.min(total - entry.transferred),
                total,
            };
            if let Err(e) = self.transport.transfer_chunk(&chunk).await {
                let error = Error::Transfer {
                    task_id: entry.task.id.clone(),
                    transferred: entry.transferred,
                    total,
                    reason: e.to_string(),
                };
                return (entry, Transfer::Failed(error));
            }
            entry.transferred += chunk.len;
            entry.task.report(entry.transferred);

            if entry.transferred < total {
                let delay = self
                    .policy
                    .chunk_delay(self.power.current_profile().network_usage);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        (entry, Transfer::Completed)
    }

    fn continuation_blocker(&self) -> Option<PauseReason> {
        let battery = self.power.battery();
        if !battery.charging && battery.level < self.policy.min_transfer_battery {
            return Some(PauseReason::LowBattery);
        }
        if !self.network().is_connected() {
            return Some(PauseReason::Offline);
        }
        None
    }

    fn pause(&self, entry: Entry, reason: PauseReason) {
        let progress = entry.progress();
        tracing::info!(
            task_id = %progress.task_id,
            transferred = progress.transferred,
            total = progress.total,
            ?reason,
            "sync task paused"
        );
        self.events.emit(SyncEvent::Paused { progress, reason });
        insert_by_priority(&mut self.queue.lock(), entry);
    }

    /// Returns `true` if the task stays queued.
    fn record_failure(&self, mut entry: Entry, error: Error) -> bool {
        entry.attempts += 1;
        let will_retry = entry.attempts < self.policy.max_attempts;
        tracing::warn!(
            task_id = %entry.task.id,
            attempts = entry.attempts,
            will_retry,
            error = %error,
            "sync chunk failed"
        );
        self.events.emit(SyncEvent::Error {
            task_id: entry.task.id.clone(),
            error,
            attempts: entry.attempts,
            will_retry,
        });
        if will_retry {
            self.pause(entry, PauseReason::ChunkFailed);
        }
        will_retry
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Process the queue every [`current_interval`](Self::current_interval).
    ///
    /// When `network` is given it is polled before each run; otherwise the
    /// host pushes changes through [`update_network`](Self::update_network).
    pub fn start(self: &Arc<Self>, network: Option<Arc<dyn NetworkSource>>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("sync scheduler started");
            loop {
                let interval = scheduler.current_interval();
                if !sleep_or_cancel(interval, &cancel).await {
                    break;
                }
                if let Some(source) = &network {
                    scheduler.update_network(source.conditions());
                }
                scheduler.process_queue().await;
            }
            tracing::debug!("sync scheduler stopped");
        });
    }

    /// Stop the periodic loop. A run in progress finishes its current batch.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

fn insert_by_priority(queue: &mut Vec<Entry>, entry: Entry) {
    let at = queue
        .iter()
        .position(|e| e.task.priority < entry.task.priority)
        .unwrap_or(queue.len());
    queue.insert(at, entry);
}

impl std::fmt::Debug for NetworkSyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSyncScheduler")
            .field("conditions", &*self.conditions.read())
            .field("queued", &self.queue.lock().len())
            .field("deferred", &self.deferred.lock().len())
            .field("processing", &self.processing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
