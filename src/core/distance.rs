//! Log-distance path-loss model for turning RSSI into meters.

use serde::{Deserialize, Serialize};

/// Default RSSI measured at one meter from a typical beacon (dBm).
pub const DEFAULT_CALIBRATION_A: f64 = -60.0;

/// Default path-loss exponent (2.0 is free space, indoors is usually higher).
pub const DEFAULT_PATH_LOSS_N: f64 = 2.6;

/// Maps a signal strength to an approximate distance.
///
/// `distance = 10^((A - rssi) / (10 * n))`
///
/// Both constants come from configuration. A mis-calibrated `A` scales every
/// estimate by a constant factor without raising any error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceModel {
    /// RSSI at the one meter reference (dBm)
    pub calibration_a: f64,
    /// Path-loss exponent
    pub path_loss_n: f64,
}

impl DistanceModel {
    /// Create a model with explicit calibration values.
    pub fn new(calibration_a: f64, path_loss_n: f64) -> Self {
        Self {
            calibration_a,
            path_loss_n,
        }
    }

    /// Estimated distance in meters for the given signal strength (dBm).
    pub fn distance(&self, signal_strength: f64) -> f64 {
        10f64.powf((self.calibration_a - signal_strength) / (10.0 * self.path_loss_n))
    }
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self::new(DEFAULT_CALIBRATION_A, DEFAULT_PATH_LOSS_N)
    }
}
