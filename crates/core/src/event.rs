//! Event broadcasting for controller observability.
//!
//! Every controller owns an [`EventBus`] of its own event enum. Subscribers
//! receive cloned copies via [`EventBus::subscribe`]; each event reports the
//! named signal it corresponds to through [`Signal::name`].

use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A named event signal, e.g. `memory-warning` or `page-loaded`.
pub trait Signal {
    /// The kebab-case signal name of this event.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Fan-out of one controller's events to any number of listeners.
///
/// Emitting never blocks and never fails. Events sent while nobody listens
/// are lost; a listener more than `capacity` events behind skips ahead.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// A bus retaining up to `capacity` undelivered events per listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every current listener.
    pub fn emit(&self, event: E) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    /// Listen for events emitted from now on. A lagging listener gets
    /// `RecvError::Lagged` once and resumes at the oldest retained event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Listeners currently attached.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(256)
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.sender.receiver_count())
            .finish()
    }
}
