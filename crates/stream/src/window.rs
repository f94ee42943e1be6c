//! Closed windows and window events.

use chrono::{DateTime, Utc};

use lowtide_core::Signal;

/// Where a window sits in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBounds {
    /// Item positions `start..end` of the stream
    Index {
        /// First position, inclusive
        start: u64,
        /// Last position, exclusive
        end: u64,
    },
    /// Timestamps `start..=end`
    Time {
        /// Earliest member timestamp
        start: DateTime<Utc>,
        /// Latest member timestamp
        end: DateTime<Utc>,
    },
}

/// A closed window. Windows never change after they are created.
#[derive(Debug, Clone, PartialEq)]
pub struct DataWindow<T, A> {
    /// Monotonic id
    pub id: u64,
    /// Position in the stream
    pub bounds: WindowBounds,
    /// Member items in arrival order
    pub items: Vec<T>,
    /// Aggregate over `items`, when an aggregate function is configured
    pub aggregate: Option<A>,
}

impl<T, A> DataWindow<T, A> {
    /// Number of member items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the window has no members.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Events emitted by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    /// A window closed
    Created {
        /// Window id
        id: u64,
        /// Member count
        len: usize,
        /// Position in the stream
        bounds: WindowBounds,
    },
    /// The oldest window was dropped to stay within `max_windows`
    Removed {
        /// Window id
        id: u64,
    },
}

impl Signal for WindowEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "window-created",
            Self::Removed { .. } => "window-removed",
        }
    }
}
