//! Sync task descriptions and admission rules.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lowtide_core::{AppState, NetworkConditions};

use crate::policy::is_unmetered;

/// Callback receiving transfer progress.
pub type ProgressFn = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Device to server
    Upload,
    /// Server to device
    Download,
}

/// Progress of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Task id
    pub task_id: String,
    /// Bytes transferred so far
    pub transferred: u64,
    /// Total bytes
    pub total: u64,
}

impl SyncProgress {
    /// Completion in `0.0..=1.0`. An empty task is complete.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }
}

/// A unit of upload or download work.
#[derive(Clone)]
pub struct SyncTask {
    /// Unique id
    pub id: String,
    /// Higher runs sooner
    pub priority: i32,
    /// Bytes to move
    pub size_bytes: u64,
    /// Upload or download
    pub direction: SyncDirection,
    /// Only run on Wi-Fi or Ethernet
    pub requires_wifi: bool,
    /// May run on cellular
    pub allow_cellular: bool,
    /// May run while the app is backgrounded
    pub allow_background: bool,
    on_progress: Option<ProgressFn>,
}

impl SyncTask {
    /// A task with priority 0 allowed everywhere.
    pub fn new(id: impl Into<String>, direction: SyncDirection, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            size_bytes,
            direction,
            requires_wifi: false,
            allow_cellular: true,
            allow_background: true,
            on_progress: None,
        }
    }

    /// Shorthand for an upload.
    pub fn upload(id: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(id, SyncDirection::Upload, size_bytes)
    }

    /// Shorthand for a download.
    pub fn download(id: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(id, SyncDirection::Download, size_bytes)
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require Wi-Fi.
    #[must_use]
    pub fn wifi_only(mut self) -> Self {
        self.requires_wifi = true;
        self
    }

    /// Allow or forbid cellular.
    #[must_use]
    pub fn allow_cellular(mut self, allow: bool) -> Self {
        self.allow_cellular = allow;
        self
    }

    /// Allow or forbid running in the background.
    #[must_use]
    pub fn allow_background(mut self, allow: bool) -> Self {
        self.allow_background = allow;
        self
    }

    /// Report progress after every chunk.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(SyncProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub(crate) fn report(&self, transferred: u64) {
        if let Some(callback) = &self.on_progress {
            callback(SyncProgress {
                task_id: self.id.clone(),
                transferred,
                total: self.size_bytes,
            });
        }
    }

    /// Why this task may not run under the given conditions, if anything.
    #[must_use]
    pub fn admission(&self, network: &NetworkConditions, app: AppState) -> Option<DeferReason> {
        if self.requires_wifi && !is_unmetered(network) {
            return Some(DeferReason::WifiRequired);
        }
        if network.is_cellular() && !self.allow_cellular {
            return Some(DeferReason::CellularNotAllowed);
        }
        if !app.is_foreground() && !self.allow_background {
            return Some(DeferReason::Backgrounded);
        }
        None
    }
}

impl fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("size_bytes", &self.size_bytes)
            .field("direction", &self.direction)
            .field("requires_wifi", &self.requires_wifi)
            .field("allow_cellular", &self.allow_cellular)
            .field("allow_background", &self.allow_background)
            .finish_non_exhaustive()
    }
}

/// Why a task was not admitted to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeferReason {
    /// Needs Wi-Fi, current network is something else
    WifiRequired,
    /// On cellular and the task forbids it
    CellularNotAllowed,
    /// App is backgrounded and the task forbids it
    Backgrounded,
    /// No connectivity
    Offline,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WifiRequired => "wifi required",
            Self::CellularNotAllowed => "cellular not allowed",
            Self::Backgrounded => "app backgrounded",
            Self::Offline => "offline",
        })
    }
}

/// Why a transfer stopped between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    /// Battery below the transfer minimum and not charging
    LowBattery,
    /// Connectivity lost
    Offline,
    /// The chunk transport returned an error
    ChunkFailed,
}

/// Result of an [`enqueue`](crate::NetworkSyncScheduler::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// In the run queue
    Queued,
    /// Held back until conditions change
    Deferred(DeferReason),
}
