//! Pipeline counters.
//!
//! Tracks how much flowed through each stage so a run can be audited
//! afterwards, e.g. to tell a quiet radio apart from a failing uplink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Counters shared by the pipeline stages.
#[derive(Debug)]
pub struct PipelineStats {
    /// Sightings handed to the queue
    sightings_received: AtomicU64,
    /// Transient scanner faults
    sensor_faults: AtomicU64,
    /// Windows that produced a batch
    windows_flushed: AtomicU64,
    /// Windows with nothing to report
    empty_windows: AtomicU64,
    /// Batches confirmed by the remote store
    batches_delivered: AtomicU64,
    /// Deliveries that left a checkpoint behind
    delivery_failures: AtomicU64,
    /// Batches lost to serialization errors
    batches_lost: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            sightings_received: AtomicU64::new(0),
            sensor_faults: AtomicU64::new(0),
            windows_flushed: AtomicU64::new(0),
            empty_windows: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            batches_lost: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that resume from, and save back to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            debug!(error = %e, "no previous pipeline stats loaded");
        }

        stats
    }

    pub fn record_sighting(&self) {
        self.sightings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sensor_fault(&self) {
        self.sensor_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_flushed(&self) {
        self.windows_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_window(&self) {
        self.empty_windows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_lost(&self) {
        self.batches_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sightings_received: self.sightings_received.load(Ordering::Relaxed),
            sensor_faults: self.sensor_faults.load(Ordering::Relaxed),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
            empty_windows: self.empty_windows.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            batches_lost: self.batches_lost.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let snapshot = self.snapshot();
            let persisted = PersistedStats {
                sightings_received: snapshot.sightings_received,
                sensor_faults: snapshot.sensor_faults,
                windows_flushed: snapshot.windows_flushed,
                empty_windows: snapshot.empty_windows,
                batches_delivered: snapshot.batches_delivered,
                delivery_failures: snapshot.delivery_failures,
                batches_lost: snapshot.batches_lost,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let persisted = load_persisted(path)?;

                self.sightings_received
                    .store(persisted.sightings_received, Ordering::Relaxed);
                self.sensor_faults
                    .store(persisted.sensor_faults, Ordering::Relaxed);
                self.windows_flushed
                    .store(persisted.windows_flushed, Ordering::Relaxed);
                self.empty_windows
                    .store(persisted.empty_windows, Ordering::Relaxed);
                self.batches_delivered
                    .store(persisted.batches_delivered, Ordering::Relaxed);
                self.delivery_failures
                    .store(persisted.delivery_failures, Ordering::Relaxed);
                self.batches_lost
                    .store(persisted.batches_lost, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sightings_received: u64,
    pub sensor_faults: u64,
    pub windows_flushed: u64,
    pub empty_windows: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub batches_lost: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline Statistics:\n\
             - Sightings received: {}\n\
             - Sensor faults: {}\n\
             - Windows flushed: {}\n\
             - Empty windows: {}\n\
             - Batches delivered: {}\n\
             - Delivery failures: {}\n\
             - Batches lost: {}\n\
             - Session duration: {} seconds",
            self.sightings_received,
            self.sensor_faults,
            self.windows_flushed,
            self.empty_windows,
            self.batches_delivered,
            self.delivery_failures,
            self.batches_lost,
            self.session_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub sightings_received: u64,
    pub sensor_faults: u64,
    pub windows_flushed: u64,
    pub empty_windows: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub batches_lost: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read previously saved stats, e.g. for a status report.
pub fn load_persisted(path: &std::path::Path) -> Result<PersistedStats, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(std::io::Error::other)
}

/// Thread-safe shared stats.
pub type SharedStats = Arc<PipelineStats>;

/// Create a new shared stats handle.
pub fn create_shared_stats() -> SharedStats {
    Arc::new(PipelineStats::new())
}

/// Create a new shared stats handle with persistence.
pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(PipelineStats::with_persistence(path))
}
