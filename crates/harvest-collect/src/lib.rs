//! Runtime data plane for the order-book harvester.
//!
//! Two processes share a filesystem root and communicate only through an
//! atomically replaced snapshot file per venue:
//! - `run-discovery` rediscovers instruments on a slow cadence, diffs
//!   membership, and publishes the snapshot
//! - `run-logger` polls order books for the snapshotted instruments with
//!   per-instrument backoff, per-venue AIMD inflight control, and rotating
//!   JSONL output

pub mod aimd;
pub mod backoff;
pub mod config;
pub mod discovery;
pub mod jsonl;
pub mod reader;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod workers;
