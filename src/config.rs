//! Configuration for the BLE Sensor Agent.

use crate::core::distance::{DistanceModel, DEFAULT_CALIBRATION_A, DEFAULT_PATH_LOSS_N};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-user config/data directory.
pub const APP_DIR: &str = "ble-sensor-agent";

const DEFAULT_AGGREGATION_PERIOD_SECS: f64 = 0.75;

/// Accepted range for `aggregation_period_seconds`.
const MIN_AGGREGATION_PERIOD: Duration = Duration::from_millis(1);
const MAX_AGGREGATION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

fn period_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|p| (MIN_AGGREGATION_PERIOD..=MAX_AGGREGATION_PERIOD).contains(p))
}

/// Main configuration for the sensor agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RSSI at one meter (dBm)
    #[serde(rename = "scan_calibration_A", alias = "scan_calibration_a")]
    pub scan_calibration_a: f64,

    /// Path-loss exponent
    pub scan_path_loss_n: f64,

    /// Length of each aggregation window
    pub aggregation_period_seconds: f64,

    /// Remote store location (`http://`, `https://`, `sftp://user@host/dir` or `file://`)
    pub remote_endpoint: Option<String>,

    /// Bearer token (HTTP) or password (SFTP) for the remote store
    pub remote_credentials: Option<String>,

    /// Prefix prepended to every remote file path
    pub remote_dir: String,

    /// Where batches wait until the remote store confirms them
    pub local_checkpoint_dir: PathBuf,

    /// Path for storing pipeline statistics
    pub data_path: PathBuf,

    /// Identifier of this sensor, sent along with uploads
    pub sensor_id: String,

    /// Timeout for a single upload (seconds)
    pub transport_timeout_secs: u64,

    /// How long shutdown waits for in-flight deliveries (seconds)
    pub final_delivery_timeout_secs: u64,

    /// Re-deliver checkpoints left over from earlier runs before starting
    pub retry_pending_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        let sensor_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            scan_calibration_a: DEFAULT_CALIBRATION_A,
            scan_path_loss_n: DEFAULT_PATH_LOSS_N,
            aggregation_period_seconds: DEFAULT_AGGREGATION_PERIOD_SECS,
            remote_endpoint: None,
            remote_credentials: None,
            remote_dir: String::new(),
            local_checkpoint_dir: data_dir.join("checkpoints"),
            data_path: data_dir,
            sensor_id,
            transport_timeout_secs: 30,
            final_delivery_timeout_secs: 10,
            retry_pending_on_start: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the given location.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.local_checkpoint_dir)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.scan_calibration_a.is_finite() {
            return Err(ConfigError::Invalid(
                "scan_calibration_A must be a finite number".to_string(),
            ));
        }
        if !(self.scan_path_loss_n.is_finite() && self.scan_path_loss_n > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "scan_path_loss_n must be positive, got {}",
                self.scan_path_loss_n
            )));
        }
        if period_from_secs(self.aggregation_period_seconds).is_none() {
            return Err(ConfigError::Invalid(format!(
                "aggregation_period_seconds must be between 0.001 and 86400, got {}",
                self.aggregation_period_seconds
            )));
        }
        if self.final_delivery_timeout_secs == 0 || self.transport_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least one second".to_string(),
            ));
        }
        match self.remote_endpoint.as_deref().map(str::trim) {
            None | Some("") => Err(ConfigError::Invalid(
                "remote_endpoint is not set".to_string(),
            )),
            Some(endpoint) if !endpoint.contains("://") => Err(ConfigError::Invalid(format!(
                "remote_endpoint '{endpoint}' has no scheme"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Distance model built from the calibration values.
    pub fn distance_model(&self) -> DistanceModel {
        DistanceModel::new(self.scan_calibration_a, self.scan_path_loss_n)
    }

    /// Aggregation period as a duration. Out-of-range values fall back to the
    /// default; `validate` reports them.
    pub fn aggregation_period(&self) -> Duration {
        period_from_secs(self.aggregation_period_seconds)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_AGGREGATION_PERIOD_SECS))
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    pub fn final_delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.final_delivery_timeout_secs)
    }

    /// Where pipeline statistics are persisted.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
