//! Atomic snapshot handoff between the discovery and polling processes.
//!
//! One file per venue at `<root>/<venue>/state/active_instruments.snapshot.json`.
//! The writer serializes to a sibling temp file, fsyncs it, then renames over
//! the target, so a reader only ever sees a complete prior or complete new
//! snapshot.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;

use harvest_common::ActiveSet;

pub const SNAPSHOT_FILE: &str = "active_instruments.snapshot.json";

/// Snapshot path for a venue under the output root.
pub fn snapshot_path(output_dir: &Path, venue: &str) -> PathBuf {
    output_dir.join(venue).join("state").join(SNAPSHOT_FILE)
}

/// Snapshot read failures. Both variants are non-fatal to the poller, which
/// keeps its last good (or empty) set and retries at the next read cadence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot missing: {0}")]
    Missing(PathBuf),

    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Atomically replace the snapshot file with a new ActiveSet.
pub fn write_snapshot(path: &Path, set: &ActiveSet) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let data = serde_json::to_vec(set)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&data)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and parse the snapshot file, regardless of freshness.
pub fn read_snapshot(path: &Path) -> Result<ActiveSet, SnapshotError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::Missing(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&data).map_err(|e| SnapshotError::Corrupt(e.to_string()))
}

/// Snapshot reader with freshness detection: when neither the file mtime nor
/// `asof_ts_utc` has moved, the re-parse is skipped entirely.
#[derive(Debug)]
pub struct SnapshotReader {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
    last_asof: Option<DateTime<Utc>>,
}

impl SnapshotReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: None,
            last_asof: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(Some(set))` when a newer snapshot was parsed, `Ok(None)`
    /// when the file is unchanged since the last successful read.
    pub fn read_if_changed(&mut self) -> Result<Option<ActiveSet>, SnapshotError> {
        let mtime = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        if mtime.is_some() && mtime == self.last_mtime {
            return Ok(None);
        }

        let set = read_snapshot(&self.path)?;
        self.last_mtime = mtime;
        if self.last_asof == Some(set.asof_ts_utc) {
            // Same write observed through a touched mtime; nothing new.
            return Ok(None);
        }
        self.last_asof = Some(set.asof_ts_utc);
        Ok(Some(set))
    }
}
