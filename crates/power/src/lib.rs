//! # Lowtide Power
//!
//! Battery-driven power profiles.
//!
//! [`PowerProfileController`] picks one of four [`PowerProfile`]s from each
//! battery sample and the app's foreground state, tells registered
//! [`ProfileHook`]s about changes, and holds background tasks back until the
//! active profile and the task's own constraints allow them to run.
//!
//! ```rust
//! use lowtide_core::BatteryStatus;
//! use lowtide_power::{PowerThresholds, ProfileKind, select_optimal_profile};
//!
//! let status = BatteryStatus::new(8.0, false)?;
//! assert_eq!(
//!     select_optimal_profile(status, &PowerThresholds::default()),
//!     ProfileKind::UltraPowerSaver,
//! );
//! # Ok::<(), lowtide_core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod controller;
pub mod hook;
pub mod profile;

pub use controller::{
    ChangeReason, DeferredRun, PowerConfig, PowerEvent, PowerProfileController, TaskConstraints,
    TaskFn, TaskOutcome,
};
pub use hook::ProfileHook;
pub use profile::{
    Feature, NetworkUsage, PowerProfile, PowerThresholds, ProfileKind, ProfileTable,
    select_optimal_profile,
};
