//! # Lowtide Sync
//!
//! Network sync scheduling driven by battery, connectivity and the active
//! power profile.
//!
//! - [`SyncPolicy`] turns a battery sample, network conditions and a
//!   [`PowerProfile`](lowtide_power::PowerProfile) into a polling interval
//!   and a [`QualityLevel`].
//! - [`NetworkSyncScheduler`] admits [`SyncTask`]s by priority, defers the
//!   ones current conditions forbid and moves bytes in resumable chunks
//!   through a host [`ChunkTransport`] while holding a [`WakeLock`].
//!
//! ```rust
//! use lowtide_core::{BatteryStatus, CellularGeneration, NetworkConditions};
//! use lowtide_power::{PowerProfile, ProfileKind};
//! use lowtide_sync::{QualityLevel, SyncPolicy};
//!
//! let policy = SyncPolicy::default();
//! let battery = BatteryStatus::new(80.0, false)?;
//! let profile = PowerProfile::preset(ProfileKind::Balanced);
//! let network = NetworkConditions::cellular(CellularGeneration::G3, Some(20.0));
//!
//! assert_eq!(policy.quality(battery, &network, &profile), QualityLevel::Low);
//! # Ok::<(), lowtide_core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod policy;
pub mod scheduler;
pub mod task;
pub mod transport;

pub use policy::{QualityLevel, QualitySettings, SyncPolicy};
pub use scheduler::{NetworkSyncScheduler, ProcessReport, SyncEvent};
pub use task::{
    Admission, DeferReason, PauseReason, ProgressFn, SyncDirection, SyncProgress, SyncTask,
};
pub use transport::{Chunk, ChunkTransport, NoopWakeLock, WakeLock, WakeLockGuard};
