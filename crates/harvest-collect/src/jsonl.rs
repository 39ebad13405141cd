//! Append-only JSONL writer with UTC-day partitioning and periodic fsync.
//!
//! Layout per stream: `<root>/date=YYYY-MM-DD/<prefix>.part-NNNN.jsonl`.
//! The partition a record lands in is decided by the record's own `ts_ms`,
//! so the first record of a new UTC day closes the current file and opens
//! part-0000 in the new day's directory. Part numbering within a day is
//! monotonic and continues across restarts: opening a day scans existing
//! parts and starts at `max + 1`.
//!
//! Writes are buffered; the buffer is flushed and fsynced every
//! `fsync_interval` or after `fsync_records` records, whichever comes
//! first. Per-record flushing is intentionally not done: on a hard kill
//! the tail past the last fsync may be truncated, and readers recover by
//! skipping a trailing partial line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::WriterConfig;

/// Log-writing failures. Fatal for the affected stream if persistent; the
/// owning loop drops the file handle and retries the open on the next write.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record ts_ms {0} is not a valid timestamp")]
    BadTimestamp(i64),
}

/// UTC calendar day of an epoch-ms timestamp.
fn utc_day(ts_ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).map(|dt| dt.date_naive())
}

/// Scan a day directory for `<prefix>.part-NNNN.jsonl` files and return the
/// next part number (`max + 1`, or 0 for a fresh directory).
fn next_part_number(dir: &Path, prefix: &str) -> std::io::Result<u32> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut max_part: Option<u32> = None;
    let lead = format!("{prefix}.part-");
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&lead) else {
            continue;
        };
        let Some(digits) = rest.strip_suffix(".jsonl") else {
            continue;
        };
        if let Ok(part) = digits.parse::<u32>() {
            max_part = Some(max_part.map_or(part, |m| m.max(part)));
        }
    }
    Ok(max_part.map_or(0, |m| m + 1))
}

/// Rotating JSONL writer for one (venue, stream).
pub struct RotatingJsonlWriter {
    /// Stream root, e.g. `<out>/<venue>/orderbooks`.
    root: PathBuf,
    /// File prefix, e.g. `orderbooks` or `stats`.
    prefix: String,
    cfg: WriterConfig,
    current_date: Option<NaiveDate>,
    current_path: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    unsynced_records: usize,
    last_fsync: Instant,
}

impl RotatingJsonlWriter {
    pub fn new(root: PathBuf, prefix: impl Into<String>, cfg: WriterConfig) -> Self {
        Self {
            root,
            prefix: prefix.into(),
            cfg,
            current_date: None,
            current_path: None,
            file: None,
            unsynced_records: 0,
            last_fsync: Instant::now(),
        }
    }

    /// Path of the currently open part file, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    fn open_for_day(&mut self, day: NaiveDate) -> Result<(), WriteError> {
        self.close()?;

        let dir = self.root.join(format!("date={}", day.format("%Y-%m-%d")));
        fs::create_dir_all(&dir)?;
        let part = next_part_number(&dir, &self.prefix)?;
        let path = dir.join(format!("{}.part-{:04}.jsonl", self.prefix, part));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(BufWriter::new(file));
        self.current_date = Some(day);
        self.current_path = Some(path);
        self.unsynced_records = 0;
        self.last_fsync = Instant::now();
        Ok(())
    }

    /// Append one record as a single JSON line. The record's `ts_ms` picks
    /// the UTC-day partition; crossing midnight rolls the file.
    pub fn write<T: Serialize>(&mut self, record: &T, ts_ms: i64) -> Result<(), WriteError> {
        let day = utc_day(ts_ms).ok_or(WriteError::BadTimestamp(ts_ms))?;
        if self.file.is_none() || self.current_date != Some(day) {
            self.open_for_day(day)?;
        }

        let result = self.write_line(record);
        if result.is_err() {
            // Drop the handle so the next write reopens the stream.
            self.file = None;
        }
        result
    }

    fn write_line<T: Serialize>(&mut self, record: &T) -> Result<(), WriteError> {
        let line = serde_json::to_vec(record)?;
        let file = self.file.as_mut().expect("writer opened above");
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        self.unsynced_records += 1;

        if self.unsynced_records >= self.cfg.fsync_records
            || self.last_fsync.elapsed() >= self.cfg.fsync_interval
        {
            self.sync()?;
        }
        Ok(())
    }

    /// Flush buffered lines and fsync the current file.
    pub fn sync(&mut self) -> Result<(), WriteError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        self.unsynced_records = 0;
        self.last_fsync = Instant::now();
        Ok(())
    }

    /// Flush, fsync, and drop the current file handle. Safe to call twice.
    pub fn close(&mut self) -> Result<(), WriteError> {
        if self.file.is_some() {
            self.sync()?;
        }
        self.file = None;
        self.current_date = None;
        self.current_path = None;
        Ok(())
    }
}

impl Drop for RotatingJsonlWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Rec {
        ts_ms: i64,
        seq: u32,
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("harvest_jsonl_{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cfg() -> WriterConfig {
        WriterConfig {
            fsync_interval: Duration::from_secs(1),
            fsync_records: 256,
        }
    }

    // 2024-01-01T00:00:00Z
    const DAY1_MS: i64 = 1_704_067_200_000;
    const DAY_MS: i64 = 86_400_000;

    #[test]
    fn test_writes_one_line_per_record() {
        let dir = scratch_dir("lines");
        let mut w = RotatingJsonlWriter::new(dir.clone(), "orderbooks", cfg());
        for seq in 0..3 {
            w.write(&Rec { ts_ms: DAY1_MS + seq as i64, seq }, DAY1_MS).unwrap();
        }
        w.close().unwrap();

        let path = dir.join("date=2024-01-01/orderbooks.part-0000.jsonl");
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let rec: Rec = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(rec.seq, 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_utc_day_rollover() {
        let dir = scratch_dir("rollover");
        let mut w = RotatingJsonlWriter::new(dir.clone(), "orderbooks", cfg());

        // One record just before midnight, one just after.
        w.write(&Rec { ts_ms: DAY1_MS + DAY_MS - 1, seq: 0 }, DAY1_MS + DAY_MS - 1)
            .unwrap();
        w.write(&Rec { ts_ms: DAY1_MS + DAY_MS, seq: 1 }, DAY1_MS + DAY_MS)
            .unwrap();
        w.close().unwrap();

        let d1 = dir.join("date=2024-01-01/orderbooks.part-0000.jsonl");
        let d2 = dir.join("date=2024-01-02/orderbooks.part-0000.jsonl");
        assert_eq!(fs::read_to_string(&d1).unwrap().lines().count(), 1);
        assert_eq!(fs::read_to_string(&d2).unwrap().lines().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_part_continuity_across_restart() {
        let dir = scratch_dir("parts");
        {
            let mut w = RotatingJsonlWriter::new(dir.clone(), "orderbooks", cfg());
            w.write(&Rec { ts_ms: DAY1_MS, seq: 0 }, DAY1_MS).unwrap();
            w.close().unwrap();
        }
        // Simulated restart: the new writer must continue at max + 1.
        {
            let mut w = RotatingJsonlWriter::new(dir.clone(), "orderbooks", cfg());
            w.write(&Rec { ts_ms: DAY1_MS + 1, seq: 1 }, DAY1_MS + 1).unwrap();
            w.close().unwrap();
        }
        assert!(dir.join("date=2024-01-01/orderbooks.part-0000.jsonl").exists());
        assert!(dir.join("date=2024-01-01/orderbooks.part-0001.jsonl").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_part_scan_skips_foreign_files() {
        let dir = scratch_dir("scan");
        let day_dir = dir.join("date=2024-01-01");
        fs::create_dir_all(&day_dir).unwrap();
        fs::write(day_dir.join("orderbooks.part-0007.jsonl"), b"{}\n").unwrap();
        fs::write(day_dir.join("stats.part-9999.jsonl"), b"{}\n").unwrap();
        fs::write(day_dir.join("notes.txt"), b"x").unwrap();

        assert_eq!(next_part_number(&day_dir, "orderbooks").unwrap(), 8);
        assert_eq!(next_part_number(&day_dir, "errors").unwrap(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fsync_after_record_threshold() {
        let dir = scratch_dir("fsync");
        let cfg = WriterConfig {
            fsync_interval: Duration::from_secs(3600),
            fsync_records: 2,
        };
        let mut w = RotatingJsonlWriter::new(dir.clone(), "orderbooks", cfg);
        w.write(&Rec { ts_ms: DAY1_MS, seq: 0 }, DAY1_MS).unwrap();
        w.write(&Rec { ts_ms: DAY1_MS, seq: 1 }, DAY1_MS).unwrap();

        // Both records hit disk without close(): the threshold forced a
        // flush + fsync.
        let path = dir.join("date=2024-01-01/orderbooks.part-0000.jsonl");
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        let _ = fs::remove_dir_all(&dir);
    }
}
