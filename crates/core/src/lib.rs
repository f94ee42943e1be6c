//! # Lowtide Core
//!
//! Core types shared by every lowtide controller.
//!
//! ## Key Components
//!
//! - **Errors**: [`Error`] / [`Result`] with the [`ErrorKind`] taxonomy
//! - **Events**: [`EventBus`] broadcast fan-out and the [`Signal`] naming trait
//! - **Signals**: battery, network and app-lifecycle observations plus the
//!   poll-style source traits the host implements
//! - **Tasks**: [`spawn_periodic`] background loops with explicit cancellation
//!
//! ## Usage
//!
//! ```rust
//! use lowtide_core::{BatteryStatus, Error, NetworkConditions};
//!
//! let battery = BatteryStatus::new(42.0, false)?;
//! let net = NetworkConditions::wifi(Some(25.0));
//! assert!(net.is_connected() && !battery.charging);
//! # Ok::<(), Error>(())
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod event;
pub mod serde_ms;
pub mod signal;
pub mod task;

pub use error::{Error, ErrorKind, Result};
pub use event::{EventBus, Signal};
pub use signal::{
    AppState, BatterySource, BatteryStatus, CellularGeneration, NetworkConditions, NetworkSource,
    NetworkType,
};
pub use task::{sleep_or_cancel, spawn_periodic};
