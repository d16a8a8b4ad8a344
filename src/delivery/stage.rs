//! Batch hand-off: serialize, checkpoint, upload, clear.

use crate::core::types::{file_name_for, Batch, DeviceSummary};
use crate::delivery::checkpoint::{CheckpointStore, PendingCheckpoint};
use crate::delivery::transport::{Transport, TransportError, UploadOutcome};
use crate::stats::SharedStats;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Confirmation that a window reached the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub window: String,
    pub remote_path: String,
    pub devices: usize,
    pub outcome: UploadOutcome,
}

/// Why a window was not delivered. Every variant names the window and its
/// device count so retained checkpoints can be matched to log lines.
#[derive(Debug)]
pub enum DeliveryError {
    /// The batch could not be encoded; its data is gone
    Serialization {
        window: String,
        devices: usize,
        message: String,
    },
    /// The checkpoint could not be written; the batch is held in memory
    Checkpoint {
        window: String,
        devices: usize,
        message: String,
    },
    /// Upload failed; the checkpoint stays on disk
    Transport {
        window: String,
        devices: usize,
        checkpoint: PathBuf,
        source: TransportError,
    },
}

impl DeliveryError {
    pub fn window(&self) -> &str {
        match self {
            DeliveryError::Serialization { window, .. }
            | DeliveryError::Checkpoint { window, .. }
            | DeliveryError::Transport { window, .. } => window,
        }
    }

    pub fn devices(&self) -> usize {
        match self {
            DeliveryError::Serialization { devices, .. }
            | DeliveryError::Checkpoint { devices, .. }
            | DeliveryError::Transport { devices, .. } => *devices,
        }
    }

    /// Whether the window's data is still recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DeliveryError::Serialization { .. })
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Serialization {
                window,
                devices,
                message,
            } => write!(
                f,
                "window {window} ({devices} devices) could not be serialized: {message}"
            ),
            DeliveryError::Checkpoint {
                window,
                devices,
                message,
            } => write!(
                f,
                "window {window} ({devices} devices) checkpoint write failed: {message}"
            ),
            DeliveryError::Transport {
                window,
                devices,
                checkpoint,
                source,
            } => write!(
                f,
                "window {window} ({devices} devices) not delivered, checkpoint kept at {}: {source}",
                checkpoint.display()
            ),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Outcome of re-delivering retained checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub delivered: usize,
    pub failed: usize,
    /// Checkpoints still on disk afterwards
    pub remaining: usize,
}

/// A batch that could not be written to disk yet.
struct Unwritten {
    label: String,
    devices: usize,
    contents: Vec<u8>,
}

/// Persists and transmits batches, keeping a checkpoint until confirmed.
pub struct DeliveryStage {
    store: CheckpointStore,
    transport: Box<dyn Transport>,
    /// Prefix for remote paths
    remote_dir: String,
    stats: SharedStats,
    /// Batches whose checkpoint write failed
    unwritten: Mutex<Vec<Unwritten>>,
}

impl DeliveryStage {
    pub fn new(
        store: CheckpointStore,
        transport: Box<dyn Transport>,
        remote_dir: impl Into<String>,
        stats: SharedStats,
    ) -> Self {
        Self {
            store,
            transport,
            remote_dir: remote_dir.into(),
            stats,
            unwritten: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Remote path for a checkpoint file name.
    pub fn remote_path_for(&self, file_name: &str) -> String {
        let dir = self.remote_dir.trim_matches('/');
        if dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{dir}/{file_name}")
        }
    }

    /// Deliver one window.
    ///
    /// Safe to call again with the same batch after a failure: the checkpoint
    /// and remote path are both derived from the window label.
    pub fn deliver(&self, batch: &Batch) -> Result<Ack, DeliveryError> {
        let devices = batch.device_count();

        let contents = serde_json::to_vec_pretty(&batch.summaries).map_err(|e| {
            self.stats.record_batch_lost();
            DeliveryError::Serialization {
                window: batch.label.clone(),
                devices,
                message: e.to_string(),
            }
        })?;

        let checkpoint = match self.store.write(&batch.label, &contents) {
            Ok(path) => path,
            Err(e) => {
                self.stats.record_delivery_failure();
                self.hold_unwritten(Unwritten {
                    label: batch.label.clone(),
                    devices,
                    contents,
                });
                return Err(DeliveryError::Checkpoint {
                    window: batch.label.clone(),
                    devices,
                    message: e.to_string(),
                });
            }
        };

        self.upload_checkpoint(&batch.label, &checkpoint, devices)
    }

    /// Re-deliver every retained checkpoint, oldest first.
    ///
    /// Batches held in memory are written out first. Stops at the first
    /// upload failure so an unreachable store is not hammered.
    pub fn retry_pending(&self) -> Result<RetryReport, std::io::Error> {
        self.write_unwritten();

        let mut report = RetryReport::default();
        let pending = self.store.pending()?;
        report.remaining = pending.len();

        for PendingCheckpoint { label, path } in pending {
            let devices = count_devices(&path);
            match self.upload_checkpoint(&label, &path, devices) {
                Ok(ack) => {
                    info!(window = %ack.window, devices, "retained checkpoint delivered");
                    report.delivered += 1;
                    report.remaining -= 1;
                }
                Err(e) => {
                    warn!(window = %label, error = %e, "retry failed, will try again later");
                    report.failed += 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Whether anything is waiting for a retry.
    pub fn has_pending(&self) -> bool {
        let unwritten = self
            .unwritten
            .lock()
            .map(|held| !held.is_empty())
            .unwrap_or(true);
        unwritten || self.store.pending().map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn upload_checkpoint(
        &self,
        label: &str,
        checkpoint: &Path,
        devices: usize,
    ) -> Result<Ack, DeliveryError> {
        let remote_path = self.remote_path_for(&file_name_for(label));

        let outcome = match self.transport.upload(checkpoint, &remote_path) {
            Ok(outcome) => outcome,
            Err(source) => {
                self.stats.record_delivery_failure();
                return Err(DeliveryError::Transport {
                    window: label.to_string(),
                    devices,
                    checkpoint: checkpoint.to_path_buf(),
                    source,
                });
            }
        };

        self.stats.record_batch_delivered();
        if let Err(e) = self.store.remove(checkpoint) {
            // Delivered already; a leftover file only causes an idempotent re-upload
            warn!(path = %checkpoint.display(), error = %e, "could not remove delivered checkpoint");
        }

        Ok(Ack {
            window: label.to_string(),
            remote_path,
            devices,
            outcome,
        })
    }

    fn hold_unwritten(&self, batch: Unwritten) {
        let mut held = self.unwritten.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|b| b.label != batch.label);
        held.push(batch);
    }

    fn write_unwritten(&self) {
        let mut held = self.unwritten.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|batch| match self.store.write(&batch.label, &batch.contents) {
            Ok(_) => false,
            Err(e) => {
                warn!(
                    window = %batch.label,
                    devices = batch.devices,
                    error = %e,
                    "checkpoint still cannot be written"
                );
                true
            }
        });
    }
}

fn count_devices(path: &Path) -> usize {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Vec<DeviceSummary>>(&bytes).ok())
        .map(|summaries| summaries.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::distance::DistanceModel;
    use crate::core::types::Sighting;
    use crate::core::windowing::Aggregator;
    use crate::stats::create_shared_stats;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory remote store whose availability can be toggled.
    #[derive(Default)]
    struct MemoryStore {
        failing: AtomicBool,
        uploads: AtomicUsize,
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    struct MemoryTransport(Arc<MemoryStore>);

    impl Transport for MemoryTransport {
        fn upload(
            &self,
            local_path: &Path,
            remote_path: &str,
        ) -> Result<UploadOutcome, TransportError> {
            self.0.uploads.fetch_add(1, Ordering::SeqCst);
            if self.0.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Network("connection refused".to_string()));
            }
            let body = std::fs::read(local_path).map_err(|e| TransportError::Io(e.to_string()))?;
            self.0
                .files
                .lock()
                .unwrap()
                .insert(remote_path.to_string(), body);
            Ok(UploadOutcome::Stored)
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn setup(remote_dir: &str) -> (tempfile::TempDir, Arc<MemoryStore>, DeliveryStage) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let remote = Arc::new(MemoryStore::default());
        let stage = DeliveryStage::new(
            store,
            Box::new(MemoryTransport(remote.clone())),
            remote_dir,
            create_shared_stats(),
        );
        (dir, remote, stage)
    }

    fn batch(devices: &[&str]) -> Batch {
        batch_closed_at(devices, Utc::now())
    }

    fn batch_closed_at(devices: &[&str], closed_at: chrono::DateTime<Utc>) -> Batch {
        let mut aggregator = Aggregator::new(DistanceModel::default());
        for id in devices {
            aggregator.ingest(Sighting {
                device_id: id.to_string(),
                display_name: "Unknown".to_string(),
                signal_strength: -60,
                observed_at: Utc::now(),
                distance: 1.0,
            });
        }
        aggregator.flush(closed_at).unwrap()
    }

    #[test]
    fn test_success_removes_checkpoint() {
        let (dir, remote, stage) = setup("");
        let batch = batch(&["a", "b"]);

        let ack = stage.deliver(&batch).unwrap();
        assert_eq!(ack.devices, 2);
        assert_eq!(ack.remote_path, batch.file_name());
        assert_eq!(ack.outcome, UploadOutcome::Stored);
        assert!(!stage.store().path_for(&batch.label).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let files = remote.files.lock().unwrap();
        let stored: Vec<DeviceSummary> =
            serde_json::from_slice(&files[&batch.file_name()]).unwrap();
        assert_eq!(stored, batch.summaries);
    }

    #[test]
    fn test_failure_retains_checkpoint() {
        let (_dir, remote, stage) = setup("");
        remote.failing.store(true, Ordering::SeqCst);
        let batch = batch(&["a"]);

        let err = stage.deliver(&batch).unwrap_err();
        assert_eq!(err.window(), batch.label);
        assert_eq!(err.devices(), 1);
        assert!(err.is_recoverable());
        assert!(stage.store().path_for(&batch.label).exists());
        assert!(stage.has_pending());
    }

    #[test]
    fn test_redeliver_after_failure_is_idempotent() {
        let (dir, remote, stage) = setup("lab");
        let batch = batch(&["a", "b", "c"]);

        remote.failing.store(true, Ordering::SeqCst);
        assert!(stage.deliver(&batch).is_err());
        assert!(stage.deliver(&batch).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        remote.failing.store(false, Ordering::SeqCst);
        stage.deliver(&batch).unwrap();
        stage.deliver(&batch).unwrap();

        let files = remote.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(&format!("lab/{}", batch.file_name())));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_retry_pending_delivers_oldest_first() {
        let (_dir, remote, stage) = setup("");
        remote.failing.store(true, Ordering::SeqCst);
        let now = Utc::now();
        let first = batch_closed_at(&["a"], now);
        let second = batch_closed_at(&["b", "c"], now + chrono::Duration::seconds(1));
        assert!(stage.deliver(&first).is_err());
        assert!(stage.deliver(&second).is_err());

        // Still down: one attempt, then stop
        let uploads_before = remote.uploads.load(Ordering::SeqCst);
        let report = stage.retry_pending().unwrap();
        assert_eq!(report, RetryReport { delivered: 0, failed: 1, remaining: 2 });
        assert_eq!(remote.uploads.load(Ordering::SeqCst), uploads_before + 1);

        remote.failing.store(false, Ordering::SeqCst);
        let report = stage.retry_pending().unwrap();
        assert_eq!(report, RetryReport { delivered: 2, failed: 0, remaining: 0 });
        assert!(!stage.has_pending());
        assert_eq!(remote.files.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unwritable_checkpoint_held_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        let store = CheckpointStore::open(&checkpoints).unwrap();
        let remote = Arc::new(MemoryStore::default());
        let stage = DeliveryStage::new(
            store,
            Box::new(MemoryTransport(remote.clone())),
            "",
            create_shared_stats(),
        );

        std::fs::remove_dir(&checkpoints).unwrap();
        let batch = batch(&["a"]);
        let err = stage.deliver(&batch).unwrap_err();
        assert!(matches!(err, DeliveryError::Checkpoint { .. }));
        assert!(stage.has_pending());

        std::fs::create_dir(&checkpoints).unwrap();
        let report = stage.retry_pending().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(remote.files.lock().unwrap().contains_key(&batch.file_name()));
    }

    #[test]
    fn test_remote_path_prefix() {
        let (_dir, _remote, stage) = setup("/scans/lab/");
        assert_eq!(stage.remote_path_for("x.json"), "scans/lab/x.json");
    }
}
