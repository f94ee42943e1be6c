//! Shared on/off switch for speculative loading.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lowtide_core::{Error, Result};

/// Whether caches and loaders may fetch ahead of what was asked for.
///
/// Clones share one flag, so a single gate can be handed to every cache and
/// loader and flipped from the power profile. A new gate is open.
#[derive(Debug, Clone)]
pub struct PrefetchGate {
    enabled: Arc<AtomicBool>,
}

impl PrefetchGate {
    /// An open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::with_enabled(true)
    }

    /// A gate starting in the given state.
    #[must_use]
    pub fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Open or close the gate. Returns the previous state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::debug!(enabled, "prefetch gate changed");
        }
        previous
    }

    /// Whether prefetching is currently allowed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `FeatureDisabled` while the gate is closed.
    pub fn check(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(Error::feature_disabled("prefetch"))
        }
    }
}

impl Default for PrefetchGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let gate = PrefetchGate::new();
        let other = gate.clone();
        assert!(other.check().is_ok());

        assert!(gate.set_enabled(false));
        assert!(!other.is_enabled());
        assert!(matches!(
            other.check(),
            Err(Error::FeatureDisabled { feature }) if feature == "prefetch"
        ));
    }
}
