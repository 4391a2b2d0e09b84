//! Connectivity snapshot model

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Satellite,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    #[default]
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Live network and power state reported by the connectivity monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectivityStatus {
    pub is_online: bool,
    pub connection_type: ConnectionType,
    pub quality: ConnectionQuality,
    /// Battery percentage, when the device reports one
    pub battery_level: Option<u8>,
    pub is_charging: bool,
    /// Last time the device was online (Unix ms)
    pub last_connected_at: Option<i64>,
}

impl ConnectivityStatus {
    /// Online over wifi with unknown battery
    #[must_use]
    pub fn online() -> Self {
        Self {
            is_online: true,
            connection_type: ConnectionType::Wifi,
            quality: ConnectionQuality::Good,
            battery_level: None,
            is_charging: false,
            last_connected_at: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_battery(mut self, level: u8, is_charging: bool) -> Self {
        self.battery_level = Some(level);
        self.is_charging = is_charging;
        self
    }

    /// Whether power allows background work given a minimum battery level
    pub fn power_allows_sync(&self, min_battery: u8) -> bool {
        self.is_charging || self.battery_level.map_or(true, |level| level >= min_battery)
    }
}
