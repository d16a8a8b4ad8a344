//! Pipeline data types: sightings in, per-device summaries out.

use crate::core::distance::DistanceModel;
use crate::scanner::types::RawSighting;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display name used when an advertisement carries no local name.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Prefix of every checkpoint / remote file name.
pub const FILE_PREFIX: &str = "scan_data";

/// Timestamp layout of window labels (UTC, millisecond resolution).
pub const WINDOW_LABEL_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// A single observation of a device, with its distance already derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    /// Hardware address or other stable identifier
    pub device_id: String,
    /// Advertised name, or "Unknown"
    pub display_name: String,
    /// RSSI in dBm
    pub signal_strength: i32,
    /// When the advertisement was received
    pub observed_at: DateTime<Utc>,
    /// Distance estimate for this single sample (meters)
    pub distance: f64,
}

impl Sighting {
    /// Build a sighting from a scanner event.
    pub fn from_raw(raw: RawSighting, model: &DistanceModel) -> Self {
        let display_name = match raw.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNKNOWN_NAME.to_string(),
        };

        Self {
            distance: model.distance(raw.rssi as f64),
            device_id: raw.device_id,
            display_name,
            signal_strength: raw.rssi,
            observed_at: raw.observed_at,
        }
    }
}

/// Averaged view of one device over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Mean of the observation times
    pub window_timestamp: DateTime<Utc>,
    pub device_id: String,
    pub display_name: String,
    /// Arithmetic mean of the raw dBm samples
    pub mean_signal_strength: f64,
    /// Distance derived from `mean_signal_strength`
    pub derived_distance: f64,
}

/// All device summaries for one closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Unique, sortable window label (see [`WINDOW_LABEL_FORMAT`])
    pub label: String,
    /// When the window was closed
    pub closed_at: DateTime<Utc>,
    /// One entry per device, in first-seen order
    pub summaries: Vec<DeviceSummary>,
}

impl Batch {
    pub fn new(closed_at: DateTime<Utc>, summaries: Vec<DeviceSummary>) -> Self {
        Self {
            label: window_label(closed_at),
            closed_at,
            summaries,
        }
    }

    /// Number of devices in the batch.
    pub fn device_count(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// File name used for both the local checkpoint and the remote copy.
    pub fn file_name(&self) -> String {
        file_name_for(&self.label)
    }
}

/// Format a window close time as a label.
pub fn window_label(closed_at: DateTime<Utc>) -> String {
    closed_at.format(WINDOW_LABEL_FORMAT).to_string()
}

/// File name for a window label.
pub fn file_name_for(label: &str) -> String {
    format!("{FILE_PREFIX}_{label}.json")
}

/// Recover the window label from a checkpoint file name.
pub fn label_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_prefix('_')?
        .strip_suffix(".json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(name: Option<&str>, rssi: i32) -> RawSighting {
        RawSighting {
            device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            name: name.map(str::to_string),
            rssi,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sighting_from_raw() {
        let model = DistanceModel::default();
        let sighting = Sighting::from_raw(raw(Some("Tile"), -60), &model);

        assert_eq!(sighting.display_name, "Tile");
        assert_eq!(sighting.signal_strength, -60);
        assert!((sighting.distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_name_is_unknown() {
        let model = DistanceModel::default();
        assert_eq!(
            Sighting::from_raw(raw(None, -70), &model).display_name,
            UNKNOWN_NAME
        );
        assert_eq!(
            Sighting::from_raw(raw(Some("  "), -70), &model).display_name,
            UNKNOWN_NAME
        );
    }

    #[test]
    fn test_window_label_and_file_name() {
        let closed_at = Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
            + chrono::Duration::milliseconds(250);
        let batch = Batch::new(closed_at, Vec::new());

        assert_eq!(batch.label, "20240309_140507_250");
        assert_eq!(batch.file_name(), "scan_data_20240309_140507_250.json");
        assert_eq!(
            label_from_file_name(&batch.file_name()),
            Some("20240309_140507_250")
        );
        assert_eq!(label_from_file_name("notes.txt"), None);
    }
}
