//! Local checkpoint directory.
//!
//! Each batch is written as one JSON file named after its window label and
//! stays there until the remote store confirms it. Whatever is left in the
//! directory at any point is exactly the set of undelivered windows.

use crate::core::types::{file_name_for, label_from_file_name};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A checkpoint found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheckpoint {
    pub label: String,
    pub path: PathBuf,
}

/// Directory holding undelivered batches.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (and create if needed) a checkpoint directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, std::io::Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self { dir };
        let removed = store.remove_partial()?;
        if removed > 0 {
            warn!(dir = %store.dir.display(), removed, "removed interrupted checkpoint writes");
        }

        let pending = store.pending()?.len();
        if pending > 0 {
            info!(dir = %store.dir.display(), pending, "checkpoint directory has undelivered windows");
        } else {
            debug!(dir = %store.dir.display(), "checkpoint directory opened (empty)");
        }

        Ok(store)
    }

    /// Look at a checkpoint directory without creating or cleaning it, e.g.
    /// while another process owns it.
    pub fn inspect<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint for a window label.
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(file_name_for(label))
    }

    /// Durably write a checkpoint, replacing any earlier copy of the same window.
    pub fn write(&self, label: &str, contents: &[u8]) -> Result<PathBuf, std::io::Error> {
        let path = self.path_for(label);
        let partial = path.with_extension("part");

        fs::write(&partial, contents)?;
        fs::File::open(&partial)?.sync_all()?;
        fs::rename(&partial, &path)?;

        debug!(path = %path.display(), bytes = contents.len(), "checkpoint written");
        Ok(path)
    }

    /// Delete a delivered checkpoint. A file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), std::io::Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete `.part` files left by a write that never reached its rename.
    fn remove_partial(&self) -> Result<usize, std::io::Error> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)?.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "part") && path.is_file() {
                self.remove(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All checkpoints on disk, oldest window first.
    pub fn pending(&self) -> Result<Vec<PendingCheckpoint>, std::io::Error> {
        let mut pending: Vec<PendingCheckpoint> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let label = label_from_file_name(file_name.to_str()?)?.to_string();
                Some(PendingCheckpoint {
                    label,
                    path: entry.path(),
                })
            })
            .collect();

        // Labels are zero-padded timestamps, so lexical order is chronological
        pending.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(pending)
    }
}
