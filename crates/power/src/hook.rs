//! Outbound hooks that apply a profile to the rest of the app.
//!
//! Hooks run in priority order (lower number = earlier). Hook errors are
//! logged but never propagated: a broken hook cannot stop a profile change.

use std::sync::Arc;

use parking_lot::RwLock;

use lowtide_core::Result;

use crate::profile::{Feature, PowerProfile};

/// Receives profile changes, e.g. to stop animations or pause uploads.
pub trait ProfileHook: Send + Sync {
    /// Human-readable name for this hook.
    fn name(&self) -> &str;

    /// Priority (lower = runs first). Default: 100.
    fn priority(&self) -> u32 {
        100
    }

    /// Called with the newly active profile.
    fn apply_profile(&self, profile: &PowerProfile) -> Result<()>;

    /// Called with the features the change switched off.
    fn disable_features(&self, _features: &[Feature]) -> Result<()> {
        Ok(())
    }
}

/// Priority-ordered set of [`ProfileHook`]s.
#[derive(Default)]
pub(crate) struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ProfileHook>>>,
}

impl HookRegistry {
    pub(crate) fn register(&self, hook: Arc<dyn ProfileHook>) {
        let mut hooks = self.hooks.write();
        hooks.push(hook);
        hooks.sort_by_key(|h| h.priority());
    }

    pub(crate) fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.name() != name);
        hooks.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub(crate) fn apply(&self, profile: &PowerProfile) {
        for hook in self.snapshot() {
            if let Err(e) = hook.apply_profile(profile) {
                tracing::warn!(
                    hook = hook.name(),
                    profile = %profile.kind,
                    error = %e,
                    "profile hook failed"
                );
            }
        }
    }

    pub(crate) fn disable(&self, features: &[Feature]) {
        for hook in self.snapshot() {
            if let Err(e) = hook.disable_features(features) {
                tracing::warn!(
                    hook = hook.name(),
                    ?features,
                    error = %e,
                    "disable-features hook failed"
                );
            }
        }
    }

    // Hooks are called without the lock held so they may register others.
    fn snapshot(&self) -> Vec<Arc<dyn ProfileHook>> {
        self.hooks.read().clone()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("count", &self.len())
            .finish()
    }
}
