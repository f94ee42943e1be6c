//! Host collaborators for moving bytes and keeping the device awake.

use std::sync::Arc;

use async_trait::async_trait;

use lowtide_core::Result;

use crate::task::SyncDirection;

/// One chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Owning sync task
    pub task_id: String,
    /// Upload or download
    pub direction: SyncDirection,
    /// Byte offset of the chunk within the task
    pub offset: u64,
    /// Chunk length in bytes
    pub len: u64,
    /// Total size of the task
    pub total: u64,
}

/// Moves chunks over the network. Implemented by the host.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Transfer one chunk. An error pauses the task at `chunk.offset`.
    async fn transfer_chunk(&self, chunk: &Chunk) -> Result<()>;
}

/// Platform wake lock. Implemented by the host.
pub trait WakeLock: Send + Sync {
    /// Keep the device awake for `tag`.
    fn acquire(&self, tag: &str);

    /// Allow the device to sleep again.
    fn release(&self, tag: &str);
}

/// [`WakeLock`] that does nothing, for hosts without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, _tag: &str) {}

    fn release(&self, _tag: &str) {}
}

/// RAII guard holding a wake lock.
///
/// The lock is released when the guard is dropped, including when the
/// holder returns early with an error or unwinds.
pub struct WakeLockGuard {
    lock: Arc<dyn WakeLock>,
    tag: &'static str,
}

impl WakeLockGuard {
    /// Acquire `lock` under `tag`.
    #[must_use]
    pub fn acquire(lock: Arc<dyn WakeLock>, tag: &'static str) -> Self {
        lock.acquire(tag);
        tracing::trace!(tag, "wake lock acquired");
        Self { lock, tag }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.lock.release(self.tag);
        tracing::trace!(tag = self.tag, "wake lock released");
    }
}

impl std::fmt::Debug for WakeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLockGuard").field("tag", &self.tag).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct Counting(AtomicI32);

    impl WakeLock for Counting {
        fn acquire(&self, _tag: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self, _tag: &str) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = Arc::new(Counting::default());
        {
            let _guard = WakeLockGuard::acquire(lock.clone(), "test");
            assert_eq!(lock.0.load(Ordering::SeqCst), 1);
        }
        assert_eq!(lock.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guard_releases_on_unwind() {
        let lock = Arc::new(Counting::default());
        let held = lock.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = WakeLockGuard::acquire(held, "test");
            panic!("transfer bug");
        });
        assert!(result.is_err());
        assert_eq!(lock.0.load(Ordering::SeqCst), 0);
    }
}
