//! Inbound signals supplied by the host application.
//!
//! Push-style signals are delivered by calling controller methods directly;
//! poll-style sources implement [`BatterySource`] or [`NetworkSource`] and are
//! handed to a controller's `start`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Battery
// ---------------------------------------------------------------------------

/// One battery observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge level in percent, `0.0..=100.0`
    pub level: f64,
    /// Whether the device is connected to external power
    pub charging: bool,
}

impl BatteryStatus {
    /// Create a validated battery status.
    pub fn new(level: f64, charging: bool) -> Result<Self> {
        if !level.is_finite() || !(0.0..=100.0).contains(&level) {
            return Err(Error::invalid_argument(
                "level",
                format!("battery level {level} is outside 0..=100"),
            ));
        }
        Ok(Self { level, charging })
    }

    /// Battery on external power at full charge.
    #[must_use]
    pub fn mains() -> Self {
        Self {
            level: 100.0,
            charging: true,
        }
    }
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self {
            level: 100.0,
            charging: false,
        }
    }
}

/// Poll-style battery source.
pub trait BatterySource: Send + Sync {
    /// Read the current battery state.
    fn battery(&self) -> Result<BatteryStatus>;
}

// ---------------------------------------------------------------------------
// App lifecycle
// ---------------------------------------------------------------------------

/// Foreground/background state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppState {
    /// The app is visible and interactive
    #[default]
    Foreground,
    /// The app is minimised or the screen is off
    Background,
}

impl AppState {
    /// Check whether the app is in the foreground
    #[must_use]
    pub fn is_foreground(self) -> bool {
        self == Self::Foreground
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Transport type reported by the reachability source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkType {
    /// Wi-Fi
    Wifi,
    /// Mobile data
    Cellular,
    /// Wired connection
    Ethernet,
    /// No connectivity
    Offline,
    /// Connected, transport unknown
    #[default]
    Unknown,
}

/// Cellular radio generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CellularGeneration {
    /// 2G
    G2,
    /// 3G
    G3,
    /// 4G / LTE
    G4,
    /// 5G
    G5,
}

/// One network-condition observation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Transport type
    pub kind: NetworkType,
    /// Estimated downlink bandwidth in megabits per second
    pub downlink_mbps: Option<f64>,
    /// Cellular generation when `kind` is cellular
    pub generation: Option<CellularGeneration>,
}

impl NetworkConditions {
    /// Wi-Fi with an optional bandwidth estimate.
    #[must_use]
    pub fn wifi(downlink_mbps: Option<f64>) -> Self {
        Self {
            kind: NetworkType::Wifi,
            downlink_mbps,
            generation: None,
        }
    }

    /// Cellular of the given generation.
    #[must_use]
    pub fn cellular(generation: CellularGeneration, downlink_mbps: Option<f64>) -> Self {
        Self {
            kind: NetworkType::Cellular,
            downlink_mbps,
            generation: Some(generation),
        }
    }

    /// No connectivity.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            kind: NetworkType::Offline,
            downlink_mbps: None,
            generation: None,
        }
    }

    /// Whether any transport is available
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.kind != NetworkType::Offline
    }

    /// Whether the transport is Wi-Fi
    #[must_use]
    pub fn is_wifi(&self) -> bool {
        self.kind == NetworkType::Wifi
    }

    /// Whether the transport is mobile data
    #[must_use]
    pub fn is_cellular(&self) -> bool {
        self.kind == NetworkType::Cellular
    }

    /// Whether the cellular generation is 2G or 3G
    #[must_use]
    pub fn is_slow_generation(&self) -> bool {
        self.is_cellular()
            && matches!(
                self.generation,
                Some(CellularGeneration::G2 | CellularGeneration::G3)
            )
    }
}

/// Poll-style network source.
pub trait NetworkSource: Send + Sync {
    /// Read the current network conditions.
    fn conditions(&self) -> NetworkConditions;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_level_is_validated() {
        assert!(BatteryStatus::new(42.0, false).is_ok());
        assert!(BatteryStatus::new(-1.0, false).is_err());
        assert!(BatteryStatus::new(100.5, true).is_err());
        assert!(BatteryStatus::new(f64::NAN, true).is_err());
    }

    #[test]
    fn slow_generation_only_on_cellular() {
        assert!(NetworkConditions::cellular(CellularGeneration::G3, None).is_slow_generation());
        assert!(!NetworkConditions::cellular(CellularGeneration::G4, None).is_slow_generation());
        let odd = NetworkConditions {
            kind: NetworkType::Wifi,
            downlink_mbps: None,
            generation: Some(CellularGeneration::G2),
        };
        assert!(!odd.is_slow_generation());
    }

    #[test]
    fn offline_is_not_connected() {
        assert!(!NetworkConditions::offline().is_connected());
        assert!(NetworkConditions::default().is_connected());
    }
}
