//! Sync interval and media quality policy.
//!
//! Both are pure functions of the battery sample, the network conditions and
//! the active power profile so they can be unit tested without a scheduler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lowtide_core::{BatteryStatus, Error, NetworkConditions, Result};
use lowtide_power::{NetworkUsage, PowerProfile, ProfileKind};

// ---------------------------------------------------------------------------
// SyncPolicy
// ---------------------------------------------------------------------------

/// Tunables of the sync scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Interval on a healthy battery. Default: 60s
    #[serde(with = "lowtide_core::serde_ms")]
    pub base_interval: Duration,
    /// Interval while charging. Default: 30s
    #[serde(with = "lowtide_core::serde_ms")]
    pub min_interval: Duration,
    /// Upper clamp, used on a low battery. Default: 30min
    #[serde(with = "lowtide_core::serde_ms")]
    pub max_interval: Duration,
    /// Battery percent below which the interval is stretched. Default: 50
    pub half_battery_level: f64,
    /// Stretch factor below `half_battery_level`. Default: 2.0
    pub half_battery_multiplier: f64,
    /// Battery percent below which the max interval applies and quality
    /// drops to Low. Default: 20
    pub low_battery_level: f64,
    /// Stretch factor on cellular. Default: 1.5
    pub cellular_multiplier: f64,
    /// Downlink (Mbps) below which quality is Low. Default: 1
    pub slow_downlink_mbps: f64,
    /// Downlink (Mbps) below which quality is at most Balanced. Default: 5
    pub medium_downlink_mbps: f64,
    /// Downlink (Mbps) above which quality is High. Default: 10
    pub fast_downlink_mbps: f64,
    /// Bytes per transfer chunk. Default: 256 KiB
    pub chunk_size: u64,
    /// Pause between chunks under `Optimized` network usage. Default: 50ms
    #[serde(with = "lowtide_core::serde_ms")]
    pub optimized_chunk_delay: Duration,
    /// Pause between chunks under `Restricted` network usage. Default: 200ms
    #[serde(with = "lowtide_core::serde_ms")]
    pub restricted_chunk_delay: Duration,
    /// Failed transfer attempts before a task is dropped. Default: 3
    pub max_attempts: u32,
    /// Battery percent below which a transfer pauses unless charging. Default: 5
    pub min_transfer_battery: f64,
    /// Concurrent transfers on Wi-Fi or Ethernet. Default: 3
    pub unmetered_concurrency: usize,
    /// Concurrent transfers otherwise. Default: 1
    pub metered_concurrency: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(30 * 60),
            half_battery_level: 50.0,
            half_battery_multiplier: 2.0,
            low_battery_level: 20.0,
            cellular_multiplier: 1.5,
            slow_downlink_mbps: 1.0,
            medium_downlink_mbps: 5.0,
            fast_downlink_mbps: 10.0,
            chunk_size: 256 * 1024,
            optimized_chunk_delay: Duration::from_millis(50),
            restricted_chunk_delay: Duration::from_millis(200),
            max_attempts: 3,
            min_transfer_battery: 5.0,
            unmetered_concurrency: 3,
            metered_concurrency: 1,
        }
    }
}

impl SyncPolicy {
    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval.is_zero() {
            return Err(Error::configuration("min_interval must be greater than zero"));
        }
        if !(self.min_interval <= self.base_interval && self.base_interval <= self.max_interval) {
            return Err(Error::configuration(
                "intervals must satisfy min_interval <= base_interval <= max_interval",
            ));
        }
        if self.half_battery_multiplier < 1.0 || self.cellular_multiplier < 1.0 {
            return Err(Error::configuration("interval multipliers must be >= 1.0"));
        }
        if self.low_battery_level >= self.half_battery_level {
            return Err(Error::configuration(
                "low_battery_level must be below half_battery_level",
            ));
        }
        if !(self.slow_downlink_mbps <= self.medium_downlink_mbps
            && self.medium_downlink_mbps <= self.fast_downlink_mbps)
        {
            return Err(Error::configuration("downlink cut-offs must be ascending"));
        }
        if self.chunk_size == 0 {
            return Err(Error::configuration("chunk_size must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(Error::configuration("max_attempts must be > 0"));
        }
        if self.unmetered_concurrency == 0 || self.metered_concurrency == 0 {
            return Err(Error::configuration("concurrency limits must be > 0"));
        }
        Ok(())
    }

    /// Sync polling interval for the given conditions.
    ///
    /// Charging forces the minimum. Otherwise the base interval is stretched
    /// below half charge and replaced by the maximum below the low level.
    /// Cellular stretches it further. The result never exceeds the maximum
    /// and is never faster than the active profile allows.
    #[must_use]
    pub fn interval(
        &self,
        battery: BatteryStatus,
        network: &NetworkConditions,
        profile: &PowerProfile,
    ) -> Duration {
        let mut interval = if battery.charging {
            self.min_interval
        } else if battery.level < self.low_battery_level {
            self.max_interval
        } else if battery.level < self.half_battery_level {
            self.base_interval.mul_f64(self.half_battery_multiplier)
        } else {
            self.base_interval
        };

        if network.is_cellular() {
            interval = interval.mul_f64(self.cellular_multiplier);
        }

        interval.min(self.max_interval).max(profile.sync_interval)
    }

    /// Quality tier for the given conditions: the worst of every rule that
    /// applies.
    #[must_use]
    pub fn quality(
        &self,
        battery: BatteryStatus,
        network: &NetworkConditions,
        profile: &PowerProfile,
    ) -> QualityLevel {
        let mut level = match network.downlink_mbps {
            _ if !network.is_connected() => QualityLevel::Minimal,
            Some(d) if d < self.slow_downlink_mbps => QualityLevel::Low,
            Some(d) if d < self.medium_downlink_mbps => QualityLevel::Balanced,
            Some(d) if d > self.fast_downlink_mbps => QualityLevel::High,
            _ => QualityLevel::Balanced,
        };

        if !battery.charging && battery.level < self.low_battery_level {
            level = level.min(QualityLevel::Low);
        }
        if network.is_slow_generation() {
            level = level.min(QualityLevel::Low);
        }
        if profile.kind == ProfileKind::UltraPowerSaver {
            level = QualityLevel::Minimal;
        }
        level
    }

    /// Pause inserted after each chunk under `usage`.
    #[must_use]
    pub fn chunk_delay(&self, usage: NetworkUsage) -> Duration {
        match usage {
            NetworkUsage::Unrestricted => Duration::ZERO,
            NetworkUsage::Optimized => self.optimized_chunk_delay,
            NetworkUsage::Restricted => self.restricted_chunk_delay,
        }
    }

    /// Transfers allowed to run at once on `network`.
    #[must_use]
    pub fn concurrency(&self, network: &NetworkConditions) -> usize {
        if is_unmetered(network) {
            self.unmetered_concurrency
        } else {
            self.metered_concurrency
        }
    }
}

/// Wi-Fi and Ethernet are treated alike for admission and concurrency.
pub(crate) fn is_unmetered(network: &NetworkConditions) -> bool {
    network.is_wifi() || network.kind == lowtide_core::NetworkType::Ethernet
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// Media quality tier, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// Text only
    Minimal,
    /// Small images, no video
    Low,
    /// Default
    Balanced,
    /// Full resolution
    High,
}

/// Concrete media knobs for a [`QualityLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    /// Tier these settings belong to
    pub level: QualityLevel,
    /// JPEG/WebP quality, 0..=100
    pub image_quality: u8,
    /// Longest image edge in pixels
    pub max_image_dimension: u32,
    /// Whether videos start playing on their own
    pub video_autoplay: bool,
    /// How many pages or items ahead to prefetch
    pub prefetch_depth: u32,
}

impl QualitySettings {
    /// Preset knobs for `level`.
    #[must_use]
    pub const fn preset(level: QualityLevel) -> Self {
        match level {
            QualityLevel::High => Self {
                level,
                image_quality: 90,
                max_image_dimension: 2048,
                video_autoplay: true,
                prefetch_depth: 5,
            },
            QualityLevel::Balanced => Self {
                level,
                image_quality: 75,
                max_image_dimension: 1280,
                video_autoplay: true,
                prefetch_depth: 3,
            },
            QualityLevel::Low => Self {
                level,
                image_quality: 50,
                max_image_dimension: 720,
                video_autoplay: false,
                prefetch_depth: 1,
            },
            QualityLevel::Minimal => Self {
                level,
                image_quality: 30,
                max_image_dimension: 480,
                video_autoplay: false,
                prefetch_depth: 0,
            },
        }
    }
}
