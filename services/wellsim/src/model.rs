//! Persisted records and collaborator payloads

use serde::{Deserialize, Serialize};

/// A metered well controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    /// Serial used to look up telemetry
    pub sn: String,
    /// Device number, sent as the 3-byte address suffix
    pub number: u32,
    /// 12-digit administrative area code
    pub area_code: u64,
    #[serde(default)]
    pub town: String,
    #[serde(default)]
    pub village: String,
    pub longitude: f64,
    pub latitude: f64,
    /// Hex-encoded 16-byte collector register number; empty until registration completes
    #[serde(default)]
    pub register_number: String,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub uploaded_water: u64,
    #[serde(default)]
    pub uploaded_electric: u64,
}

impl Device {
    /// `registered` implies a non-empty register number
    pub fn registration_consistent(&self) -> bool {
        !self.registered || !self.register_number.is_empty()
    }
}

/// Payment card tied to an area code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub area_code: u64,
    #[serde(default)]
    pub card_number: String,
    #[serde(default)]
    pub name: String,
    /// Hex-encoded card register number
    pub card_register_number: String,
    /// Balance in cents
    #[serde(default)]
    pub balance: i64,
}

/// Cumulative usage observed by the telemetry collaborator, in hundredths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub data_time: String,
    pub water_sum: u64,
    pub electric_sum: u64,
}
