//! Events emitted by a beacon scanner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One advertisement as reported by the radio, before any processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSighting {
    /// Hardware address (or platform-assigned identifier)
    #[serde(rename = "address", alias = "device_id")]
    pub device_id: String,
    /// Advertised local name, if any
    #[serde(default)]
    pub name: Option<String>,
    /// RSSI in dBm
    pub rssi: i32,
    /// Receive time
    #[serde(rename = "timestamp", default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl RawSighting {
    /// Create a sighting stamped with the current time.
    pub fn new(device_id: impl Into<String>, name: Option<String>, rssi: i32) -> Self {
        Self {
            device_id: device_id.into(),
            name,
            rssi,
            observed_at: Utc::now(),
        }
    }
}

/// What a scanner can hand to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A device was seen
    Advertisement(RawSighting),
    /// A recoverable scanner hiccup; scanning continues
    Fault(String),
}
