//! # Lowtide Stream
//!
//! Windowed aggregation over append-only item streams.
//!
//! [`WindowedAggregator`] cuts incoming items into [`DataWindow`]s using one
//! of four [`WindowMode`]s and optionally reduces each window with a pure
//! aggregate function. Closed windows are immutable; the oldest are dropped
//! once `max_windows` is exceeded.
//!
//! ```rust
//! use lowtide_stream::{WindowConfig, WindowedAggregator};
//!
//! let mut temps = WindowedAggregator::with_aggregate(WindowConfig::sliding(3, 1), |xs: &[f64]| {
//!     xs.iter().sum::<f64>() / xs.len() as f64
//! })?;
//! temps.extend([20.0, 21.0, 25.0, 22.0]);
//!
//! let averages: Vec<f64> = temps.windows().filter_map(|w| w.aggregate).collect();
//! assert_eq!(averages, vec![22.0, 68.0 / 3.0]);
//! # Ok::<(), lowtide_core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod aggregator;
pub mod config;
pub mod window;

pub use aggregator::{AggregateFn, WindowedAggregator};
pub use config::{WindowConfig, WindowMode};
pub use window::{DataWindow, WindowBounds, WindowEvent};
