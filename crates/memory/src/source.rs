//! Memory readings supplied by the platform.

use lowtide_core::{Error, Result};
use parking_lot::Mutex;
use sysinfo::System;

/// One raw memory observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    /// Bytes currently in use
    pub used_bytes: u64,
    /// Bytes available to the process in total
    pub total_bytes: u64,
}

impl MemoryReading {
    /// Create a reading.
    #[must_use]
    pub const fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// Usage in percent, clamped to `0.0..=100.0`. Zero when the total is unknown.
    #[must_use]
    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Poll-style source of memory readings.
pub trait MemorySource: Send + Sync {
    /// Take a reading. Failures are logged and skipped by the monitor.
    fn read(&self) -> Result<MemoryReading>;

    /// Ask the platform to collect garbage. Returns `true` when a hint was
    /// actually delivered.
    fn request_gc(&self) -> bool {
        false
    }
}

/// [`MemorySource`] backed by the operating system's physical memory counters.
pub struct SystemMemorySource {
    system: Mutex<System>,
}

impl SystemMemorySource {
    /// Create a source with a fresh memory snapshot.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemMemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemorySource").finish_non_exhaustive()
    }
}

impl MemorySource for SystemMemorySource {
    fn read(&self) -> Result<MemoryReading> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(Error::sampling("system memory", "total memory reported as zero"));
        }
        let used = total.saturating_sub(system.available_memory());
        Ok(MemoryReading::new(used, total))
    }
}
