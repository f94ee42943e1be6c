//! Battery-driven profile state machine with a deferred task registry.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use lowtide_core::{
    AppState, BatterySource, BatteryStatus, Error, EventBus, Result, Signal, spawn_periodic,
};

use crate::hook::{HookRegistry, ProfileHook};
use crate::profile::{
    Feature, PowerProfile, PowerThresholds, ProfileKind, ProfileTable, select_optimal_profile,
};

/// A background task body. It may be run more than once if it fails.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Power controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Battery thresholds for profile selection
    pub thresholds: PowerThresholds,
    /// Profile presets
    pub profiles: ProfileTable,
    /// Battery polling period used by [`PowerProfileController::start`]. Default: 60s
    #[serde(with = "lowtide_core::serde_ms")]
    pub poll_interval: Duration,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            thresholds: PowerThresholds::default(),
            profiles: ProfileTable::default(),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl PowerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        self.profiles.validate()?;
        if self.poll_interval.is_zero() {
            return Err(Error::configuration("poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Conditions a background task needs before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConstraints {
    /// Higher runs sooner
    pub priority: i32,
    /// Only run on external power
    pub requires_charging: bool,
    /// Minimum battery percent when not charging
    pub min_battery_level: f64,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            priority: 0,
            requires_charging: false,
            min_battery_level: 0.0,
        }
    }
}

impl TaskConstraints {
    /// Whether `battery` satisfies these constraints.
    #[must_use]
    pub fn satisfied_by(&self, battery: BatteryStatus) -> bool {
        if self.requires_charging && !battery.charging {
            return false;
        }
        battery.charging || battery.level >= self.min_battery_level
    }
}

/// What happened to a registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Ran immediately and succeeded
    Completed,
    /// Parked until conditions improve
    Deferred,
    /// Ran immediately and failed; parked for a later retry
    Failed(Error),
}

/// Result of one [`PowerProfileController::execute_deferred_tasks`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredRun {
    /// Tasks that ran and were removed
    pub completed: usize,
    /// Tasks that ran, failed and stay parked
    pub failed: usize,
    /// Tasks still parked after the pass
    pub remaining: usize,
}

struct DeferredTask {
    task: TaskFn,
    constraints: TaskConstraints,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What caused a profile change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeReason {
    /// A battery sample
    Battery,
    /// Foreground/background transition
    AppState,
    /// `set_profile_by_name`
    Manual,
}

/// Events emitted by the power controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PowerEvent {
    /// The active profile changed
    ProfileChanged {
        /// Previous profile
        from: ProfileKind,
        /// New profile
        to: ProfileKind,
        /// Trigger
        reason: ChangeReason,
    },
    /// A profile change switched features off
    FeaturesDisabled(Vec<Feature>),
    /// A task was parked
    TaskDeferred {
        /// Task id
        id: String,
    },
    /// A task ran successfully
    TaskCompleted {
        /// Task id
        id: String,
    },
    /// A task ran and failed
    TaskFailed {
        /// Task id
        id: String,
        /// The failure
        error: Error,
    },
}

impl Signal for PowerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ProfileChanged { .. } => "profile-changed",
            Self::FeaturesDisabled(_) => "features-disabled",
            Self::TaskDeferred { .. } => "task-deferred",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct State {
    battery: BatteryStatus,
    app_state: AppState,
    kind: ProfileKind,
}

/// Selects the active [`PowerProfile`] from battery and app state and gates
/// background tasks on it.
pub struct PowerProfileController {
    config: PowerConfig,
    state: RwLock<State>,
    deferred: Mutex<IndexMap<String, DeferredTask>>,
    drain_lock: tokio::sync::Mutex<()>,
    hooks: HookRegistry,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventBus<PowerEvent>,
}

impl PowerProfileController {
    /// Create a controller. The initial profile assumes a full battery on a
    /// foregrounded app until the first sample arrives.
    pub fn new(config: PowerConfig) -> Result<Self> {
        config.validate()?;
        let battery = BatteryStatus::default();
        let kind = select_optimal_profile(battery, &config.thresholds);
        Ok(Self {
            state: RwLock::new(State {
                battery,
                app_state: AppState::Foreground,
                kind,
            }),
            config,
            deferred: Mutex::new(IndexMap::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            hooks: HookRegistry::default(),
            cancel: Mutex::new(None),
            events: EventBus::default(),
        })
    }

    /// Controller configuration.
    #[must_use]
    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Subscribe to controller events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PowerEvent> {
        self.events.subscribe()
    }

    /// The active profile.
    #[must_use]
    pub fn current_profile(&self) -> PowerProfile {
        self.config.profiles.get(self.state.read().kind).clone()
    }

    /// The active profile kind.
    #[must_use]
    pub fn current_kind(&self) -> ProfileKind {
        self.state.read().kind
    }

    /// Last battery sample seen.
    #[must_use]
    pub fn battery(&self) -> BatteryStatus {
        self.state.read().battery
    }

    /// Current app state.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        self.state.read().app_state
    }

    /// Register a hook that is told about profile changes.
    pub fn register_hook(&self, hook: Arc<dyn ProfileHook>) {
        self.hooks.register(hook);
    }

    /// Remove a hook by name.
    pub fn unregister_hook(&self, name: &str) -> bool {
        self.hooks.unregister(name)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Feed a battery observation.
    ///
    /// Re-selects the profile and, when the device is charging or the level is
    /// above the healthy threshold, runs the deferred tasks.
    pub async fn on_battery_sample(&self, status: BatteryStatus) -> ProfileKind {
        let kind = {
            let mut state = self.state.write();
            state.battery = status;
            let selected = select_optimal_profile(status, &self.config.thresholds);
            downgrade_for(state.app_state, selected)
        };
        self.transition(kind, ChangeReason::Battery);

        if status.charging || status.level > self.config.thresholds.healthy {
            self.execute_deferred_tasks().await;
        }
        kind
    }

    /// Record a foreground/background transition.
    ///
    /// Backgrounding drops HighPerformance to Balanced at once. Returning to
    /// the foreground restores HighPerformance if the battery still calls
    /// for it.
    pub fn set_app_state(&self, app_state: AppState) {
        let target = {
            let mut state = self.state.write();
            state.app_state = app_state;
            match app_state {
                AppState::Background if state.kind == ProfileKind::HighPerformance => {
                    Some(ProfileKind::Balanced)
                }
                AppState::Foreground
                    if state.kind == ProfileKind::Balanced
                        && select_optimal_profile(state.battery, &self.config.thresholds)
                            == ProfileKind::HighPerformance =>
                {
                    Some(ProfileKind::HighPerformance)
                }
                _ => None,
            }
        };
        if let Some(kind) = target {
            self.transition(kind, ChangeReason::AppState);
        }
    }

    /// Switch to a profile by name until the next battery sample.
    pub fn set_profile_by_name(&self, name: &str) -> Result<PowerProfile> {
        let kind: ProfileKind = name.parse()?;
        self.transition(kind, ChangeReason::Manual);
        Ok(self.config.profiles.get(kind).clone())
    }

    fn transition(&self, to: ProfileKind, reason: ChangeReason) -> bool {
        let from = {
            let mut state = self.state.write();
            if state.kind == to {
                return false;
            }
            std::mem::replace(&mut state.kind, to)
        };

        let previous = self.config.profiles.get(from);
        let next = self.config.profiles.get(to);
        tracing::info!(%from, %to, ?reason, "power profile changed");
        self.events.emit(PowerEvent::ProfileChanged { from, to, reason });
        self.hooks.apply(next);

        let disabled = next.disabled_since(previous);
        if !disabled.is_empty() {
            self.hooks.disable(&disabled);
            self.events.emit(PowerEvent::FeaturesDisabled(disabled));
        }
        true
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Whether a task with `constraints` may run right now.
    ///
    /// The constraints must hold. The active profile's background switch only
    /// applies while the app is not in the foreground.
    #[must_use]
    pub fn can_run(&self, constraints: &TaskConstraints) -> bool {
        let state = self.state.read();
        (state.app_state.is_foreground()
            || self.config.profiles.get(state.kind).background_tasks_enabled)
            && constraints.satisfied_by(state.battery)
    }

    /// Run a task now if allowed, otherwise park it.
    ///
    /// A task that runs and fails is parked too, so a later
    /// [`execute_deferred_tasks`](Self::execute_deferred_tasks) retries it.
    pub async fn register_task(
        &self,
        id: impl Into<String>,
        task: TaskFn,
        constraints: TaskConstraints,
    ) -> Result<TaskOutcome> {
        let id = id.into();
        if self.deferred.lock().contains_key(&id) {
            return Err(Error::invalid_argument(
                "id",
                format!("task '{id}' is already deferred"),
            ));
        }

        if !self.can_run(&constraints) {
            self.park(id, task, constraints);
            return Ok(TaskOutcome::Deferred);
        }

        match task().await {
            Ok(()) => {
                tracing::debug!(task_id = %id, "background task completed");
                self.events.emit(PowerEvent::TaskCompleted { id });
                Ok(TaskOutcome::Completed)
            }
            Err(error) => {
                tracing::warn!(task_id = %id, error = %error, "task failed, parking for retry");
                self.events.emit(PowerEvent::TaskFailed {
                    id: id.clone(),
                    error: error.clone(),
                });
                self.deferred
                    .lock()
                    .insert(id, DeferredTask { task, constraints });
                Ok(TaskOutcome::Failed(error))
            }
        }
    }

    fn park(&self, id: String, task: TaskFn, constraints: TaskConstraints) {
        tracing::debug!(task_id = %id, profile = %self.current_kind(), "background task deferred");
        self.deferred
            .lock()
            .insert(id.clone(), DeferredTask { task, constraints });
        self.events.emit(PowerEvent::TaskDeferred { id });
    }

    /// Run every parked task whose constraints are now met, highest priority
    /// first. Successful tasks are removed; failed ones stay parked.
    pub async fn execute_deferred_tasks(&self) -> DeferredRun {
        let _drain = self.drain_lock.lock().await;

        let mut ready: Vec<(String, i32, TaskFn)> = self
            .deferred
            .lock()
            .iter()
            .filter(|(_, t)| self.can_run(&t.constraints))
            .map(|(id, t)| (id.clone(), t.constraints.priority, Arc::clone(&t.task)))
            .collect();
        ready.sort_by(|a, b| b.1.cmp(&a.1));

        let mut run = DeferredRun::default();
        for (id, _, task) in ready {
            // Conditions can change while earlier tasks run.
            let still_allowed = self
                .deferred
                .lock()
                .get(&id)
                .is_some_and(|t| self.can_run(&t.constraints));
            if !still_allowed {
                continue;
            }

            match task().await {
                Ok(()) => {
                    self.deferred.lock().shift_remove(&id);
                    self.events.emit(PowerEvent::TaskCompleted { id });
                    run.completed += 1;
                }
                Err(error) => {
                    tracing::warn!(task_id = %id, error = %error, "deferred task failed");
                    self.events.emit(PowerEvent::TaskFailed { id, error });
                    run.failed += 1;
                }
            }
        }
        run.remaining = self.deferred.lock().len();
        if run.completed + run.failed > 0 {
            tracing::info!(
                completed = run.completed,
                failed = run.failed,
                remaining = run.remaining,
                "deferred tasks executed"
            );
        }
        run
    }

    /// Ids of parked tasks, highest priority first.
    #[must_use]
    pub fn deferred_task_ids(&self) -> Vec<String> {
        let deferred = self.deferred.lock();
        let mut ids: Vec<(&String, i32)> = deferred
            .iter()
            .map(|(id, t)| (id, t.constraints.priority))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Drop a parked task. Returns whether it was parked.
    pub fn cancel_task(&self, id: &str) -> bool {
        self.deferred.lock().shift_remove(id).is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Poll `source` every `poll_interval`. Read failures are logged and skipped.
    pub fn start(self: &Arc<Self>, source: Arc<dyn BatterySource>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let controller = Arc::clone(self);
        spawn_periodic("power-poll", self.config.poll_interval, cancel, move || {
            let controller = Arc::clone(&controller);
            let source = Arc::clone(&source);
            async move {
                match source.battery() {
                    Ok(status) => {
                        controller.on_battery_sample(status).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "battery sample skipped"),
                }
            }
        });
    }

    /// Stop polling.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

fn downgrade_for(app_state: AppState, kind: ProfileKind) -> ProfileKind {
    if !app_state.is_foreground() && kind == ProfileKind::HighPerformance {
        ProfileKind::Balanced
    } else {
        kind
    }
}

impl std::fmt::Debug for PowerProfileController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerProfileController")
            .field("state", &*self.state.read())
            .field("deferred", &self.deferred.lock().len())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
