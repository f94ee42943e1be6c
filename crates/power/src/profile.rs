//! Power profile value objects and the battery selection rule.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lowtide_core::{BatteryStatus, Error, Result};

// ---------------------------------------------------------------------------
// ProfileKind
// ---------------------------------------------------------------------------

/// The four power profiles, ordered from most to least power hungry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    /// Everything on, fastest sync
    HighPerformance,
    /// Default on battery with a healthy charge
    Balanced,
    /// Background work off, slower sync
    PowerSaver,
    /// Bare minimum
    UltraPowerSaver,
}

impl ProfileKind {
    /// All profiles in declaration order.
    pub const ALL: [Self; 4] = [
        Self::HighPerformance,
        Self::Balanced,
        Self::PowerSaver,
        Self::UltraPowerSaver,
    ];

    /// Kebab-case name, e.g. `power-saver`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HighPerformance => "high-performance",
            Self::Balanced => "balanced",
            Self::PowerSaver => "power-saver",
            Self::UltraPowerSaver => "ultra-power-saver",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::unknown_profile(s))
    }
}

// ---------------------------------------------------------------------------
// PowerProfile
// ---------------------------------------------------------------------------

/// How freely the app may use the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkUsage {
    /// No throttling
    Unrestricted,
    /// Throttled bulk transfers
    Optimized,
    /// Essential traffic only
    Restricted,
}

/// A feature a profile can switch off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Deferred background tasks
    BackgroundTasks,
    /// Speculative prefetching
    Prefetch,
    /// Automatic uploads
    AutoUpload,
    /// UI animations
    Animations,
}

/// A named bundle of behaviour flags. Selected, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerProfile {
    /// Which profile this is
    pub kind: ProfileKind,
    /// Minimum interval between syncs
    #[serde(with = "lowtide_core::serde_ms")]
    pub sync_interval: Duration,
    /// Whether deferred background tasks may run
    pub background_tasks_enabled: bool,
    /// Whether speculative prefetching is allowed
    pub prefetch_enabled: bool,
    /// Whether uploads start automatically
    pub auto_upload_enabled: bool,
    /// Whether UI animations are allowed
    pub animations_enabled: bool,
    /// Network usage policy
    pub network_usage: NetworkUsage,
}

impl PowerProfile {
    /// Built-in preset for `kind`.
    #[must_use]
    pub fn preset(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::HighPerformance => Self {
                kind,
                sync_interval: Duration::from_secs(30),
                background_tasks_enabled: true,
                prefetch_enabled: true,
                auto_upload_enabled: true,
                animations_enabled: true,
                network_usage: NetworkUsage::Unrestricted,
            },
            ProfileKind::Balanced => Self {
                kind,
                sync_interval: Duration::from_secs(60),
                background_tasks_enabled: true,
                prefetch_enabled: true,
                auto_upload_enabled: true,
                animations_enabled: true,
                network_usage: NetworkUsage::Optimized,
            },
            ProfileKind::PowerSaver => Self {
                kind,
                sync_interval: Duration::from_secs(5 * 60),
                background_tasks_enabled: false,
                prefetch_enabled: false,
                auto_upload_enabled: false,
                animations_enabled: true,
                network_usage: NetworkUsage::Restricted,
            },
            ProfileKind::UltraPowerSaver => Self {
                kind,
                sync_interval: Duration::from_secs(15 * 60),
                background_tasks_enabled: false,
                prefetch_enabled: false,
                auto_upload_enabled: false,
                animations_enabled: false,
                network_usage: NetworkUsage::Restricted,
            },
        }
    }

    /// Whether `feature` is on in this profile.
    #[must_use]
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::BackgroundTasks => self.background_tasks_enabled,
            Feature::Prefetch => self.prefetch_enabled,
            Feature::AutoUpload => self.auto_upload_enabled,
            Feature::Animations => self.animations_enabled,
        }
    }

    /// Features on in `previous` and off in `self`.
    #[must_use]
    pub fn disabled_since(&self, previous: &Self) -> Vec<Feature> {
        [
            Feature::BackgroundTasks,
            Feature::Prefetch,
            Feature::AutoUpload,
            Feature::Animations,
        ]
        .into_iter()
        .filter(|f| previous.is_enabled(*f) && !self.is_enabled(*f))
        .collect()
    }
}

/// The configured profile for each [`ProfileKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTable {
    /// HighPerformance preset
    pub high_performance: PowerProfile,
    /// Balanced preset
    pub balanced: PowerProfile,
    /// PowerSaver preset
    pub power_saver: PowerProfile,
    /// UltraPowerSaver preset
    pub ultra_power_saver: PowerProfile,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            high_performance: PowerProfile::preset(ProfileKind::HighPerformance),
            balanced: PowerProfile::preset(ProfileKind::Balanced),
            power_saver: PowerProfile::preset(ProfileKind::PowerSaver),
            ultra_power_saver: PowerProfile::preset(ProfileKind::UltraPowerSaver),
        }
    }
}

impl ProfileTable {
    /// Profile for `kind`.
    #[must_use]
    pub fn get(&self, kind: ProfileKind) -> &PowerProfile {
        match kind {
            ProfileKind::HighPerformance => &self.high_performance,
            ProfileKind::Balanced => &self.balanced,
            ProfileKind::PowerSaver => &self.power_saver,
            ProfileKind::UltraPowerSaver => &self.ultra_power_saver,
        }
    }

    /// Check each entry sits under its own kind and that sync intervals do
    /// not shrink as profiles save more power.
    pub fn validate(&self) -> Result<()> {
        for kind in ProfileKind::ALL {
            let profile = self.get(kind);
            if profile.kind != kind {
                return Err(Error::configuration(format!(
                    "profile table entry for {kind} is labelled {}",
                    profile.kind
                )));
            }
            if profile.sync_interval.is_zero() {
                return Err(Error::configuration(format!(
                    "{kind} sync_interval must be greater than zero"
                )));
            }
        }
        let ordered = ProfileKind::ALL
            .windows(2)
            .all(|w| self.get(w[0]).sync_interval <= self.get(w[1]).sync_interval);
        if !ordered {
            return Err(Error::configuration(
                "sync_interval must not decrease from high-performance to ultra-power-saver",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Battery levels (percent) driving profile selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerThresholds {
    /// At or below: UltraPowerSaver. Default: 10
    pub critical: f64,
    /// At or below: PowerSaver. Default: 20
    pub low: f64,
    /// Above: Balanced, and deferred tasks resume. Default: 50
    pub healthy: f64,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            critical: 10.0,
            low: 20.0,
            healthy: 50.0,
        }
    }
}

impl PowerThresholds {
    /// Validate `0 <= critical < low < healthy <= 100`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0 <= self.critical
            && self.critical < self.low
            && self.low < self.healthy
            && self.healthy <= 100.0)
        {
            return Err(Error::configuration(
                "power thresholds must satisfy 0 <= critical < low < healthy <= 100",
            ));
        }
        Ok(())
    }
}

/// Pick the profile for a battery observation.
///
/// Charging always wins. Otherwise the level is bucketed: critical and below
/// is UltraPowerSaver, low and below PowerSaver, above healthy Balanced, and
/// everything in between PowerSaver.
#[must_use]
pub fn select_optimal_profile(status: BatteryStatus, thresholds: &PowerThresholds) -> ProfileKind {
    if status.charging {
        ProfileKind::HighPerformance
    } else if status.level <= thresholds.critical {
        ProfileKind::UltraPowerSaver
    } else if status.level <= thresholds.low {
        ProfileKind::PowerSaver
    } else if status.level > thresholds.healthy {
        ProfileKind::Balanced
    } else {
        ProfileKind::PowerSaver
    }
}
