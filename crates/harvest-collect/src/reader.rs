//! Offline reader for the JSONL logs.
//!
//! After a hard kill the tail of the last part file may be truncated at the
//! last fsync'd offset, so a reader must tolerate one trailing partial
//! line. Everything before that parses as ordinary JSONL.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

/// Iterate the part files of one (venue, stream, date) in part order.
pub fn part_files(stream_dir: &Path, date: &str, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let dir = stream_dir.join(format!("date={date}"));
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let lead = format!("{prefix}.part-");
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&lead) && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Parse one JSONL file into records, skipping a trailing partial line.
///
/// A malformed line in the middle of the file is a real corruption and is
/// returned as an error; only the final line is allowed to be cut short.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();

    let complete_len = match content.rfind('\n') {
        Some(idx) => idx + 1,
        // No newline at all: the single partial line is the tail.
        None => 0,
    };

    for (lineno, line) in content[..complete_len].lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}:{}: {}", path.display(), lineno + 1, e),
            )
        })?;
        records.push(record);
    }
    Ok(records)
}
