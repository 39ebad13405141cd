//! Integration tests for the discovery loop: membership-change logging,
//! snapshot freshness, expiration pruning, and failure isolation.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use harvest_collect::config::{DiscoveryConfig, WriterConfig};
use harvest_collect::discovery::VenueDiscovery;
use harvest_collect::reader::{part_files, read_jsonl};
use harvest_collect::snapshot::{read_snapshot, snapshot_path, SnapshotReader};
use harvest_common::{Instrument, MarketRecord};
use harvest_market::{DiscoveryError, FetchError, RawBook, VenueClient};

/// Scripted discovery venue: each cycle pops the next result.
struct ScriptedVenue {
    name: String,
    cycles: Mutex<VecDeque<Result<Vec<Instrument>, String>>>,
}

#[async_trait]
impl VenueClient for ScriptedVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<Instrument>, DiscoveryError> {
        match self.cycles.lock().unwrap().pop_front() {
            Some(Ok(instruments)) => Ok(instruments),
            Some(Err(message)) => Err(DiscoveryError::InvalidData(message)),
            None => Ok(Vec::new()),
        }
    }

    async fn get_orderbook(&self, _poll_key: &str) -> Result<RawBook, FetchError> {
        Err(FetchError::Network("not a polling venue".to_string()))
    }
}

fn instrument(poll_key: &str, expiration_ms: i64) -> Instrument {
    Instrument {
        venue: "mockd".to_string(),
        poll_key: poll_key.to_string(),
        market_id: format!("m-{poll_key}"),
        expiration_ms,
        slug: Some(format!("slug-{poll_key}")),
        title: None,
        outcome: None,
        underlying: None,
        rule: None,
        extra: BTreeMap::new(),
    }
}

fn discovery_with(
    dir: &PathBuf,
    cycles: Vec<Result<Vec<Instrument>, String>>,
) -> VenueDiscovery {
    let client = Arc::new(ScriptedVenue {
        name: "mockd".to_string(),
        cycles: Mutex::new(cycles.into()),
    });
    VenueDiscovery::new(
        client,
        DiscoveryConfig {
            interval: Duration::from_secs(60),
            expire_grace: Duration::ZERO,
        },
        WriterConfig {
            fsync_interval: Duration::from_secs(1),
            fsync_records: 1,
        },
        dir,
    )
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("harvest_disc_{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn today_utc() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn read_market_records(dir: &PathBuf) -> Vec<MarketRecord> {
    let files = part_files(&dir.join("mockd/markets"), &today_utc(), "markets").unwrap();
    files
        .iter()
        .flat_map(|f| read_jsonl::<MarketRecord>(f).unwrap())
        .collect()
}

#[tokio::test]
async fn test_membership_change_logging() {
    let dir = scratch_dir("membership");
    let future = Utc::now().timestamp_millis() + 3_600_000;
    let a = instrument("A", future);
    let b = instrument("B", future);
    let c = instrument("C", future);

    let mut discovery = discovery_with(
        &dir,
        vec![
            Ok(vec![a.clone(), b.clone()]),
            Ok(vec![b.clone(), c.clone()]),
        ],
    );

    // Cycle 1: A and B are new.
    assert_eq!(discovery.run_once().await, Some(2));
    let records = read_market_records(&dir);
    assert_eq!(records.len(), 2);
    let keys: Vec<&str> = records.iter().map(|r| r.instrument_id.as_str()).collect();
    assert!(keys.contains(&"mockd:A"));
    assert!(keys.contains(&"mockd:B"));

    // Cycle 2: only C is new; unchanged B is not re-logged, removed A gets
    // no removal record.
    assert_eq!(discovery.run_once().await, Some(1));
    let records = read_market_records(&dir);
    assert_eq!(records.len(), 3);
    assert_eq!(records.last().unwrap().instrument_id, "mockd:C");

    // The snapshot reflects the full current membership {B, C}.
    let set = read_snapshot(&snapshot_path(&dir, "mockd")).unwrap();
    assert_eq!(set.count, 2);
    assert!(set.contains_key("mockd:B"));
    assert!(set.contains_key("mockd:C"));
    assert!(!set.contains_key("mockd:A"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_metadata_change_is_relogged() {
    let dir = scratch_dir("metadata");
    let future = Utc::now().timestamp_millis() + 3_600_000;
    let a1 = instrument("A", future);
    let mut a2 = a1.clone();
    a2.title = Some("renamed market".to_string());

    let mut discovery = discovery_with(&dir, vec![Ok(vec![a1]), Ok(vec![a2])]);
    assert_eq!(discovery.run_once().await, Some(1));
    assert_eq!(discovery.run_once().await, Some(1));

    let records = read_market_records(&dir);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].title.as_deref(), Some("renamed market"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_expired_instruments_dropped_at_discovery() {
    let dir = scratch_dir("expiry");
    let now_ms = Utc::now().timestamp_millis();
    let live = instrument("live", now_ms + 3_600_000);
    let expired = instrument("expired", now_ms - 1_000);

    let mut discovery = discovery_with(&dir, vec![Ok(vec![live, expired])]);
    assert_eq!(discovery.run_once().await, Some(1));

    let set = read_snapshot(&snapshot_path(&dir, "mockd")).unwrap();
    assert_eq!(set.count, 1);
    assert!(set.contains_key("mockd:live"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_discovery_error_leaves_snapshot_untouched() {
    let dir = scratch_dir("error");
    let future = Utc::now().timestamp_millis() + 3_600_000;
    let a = instrument("A", future);

    let mut discovery = discovery_with(
        &dir,
        vec![Ok(vec![a]), Err("venue API down".to_string())],
    );
    assert_eq!(discovery.run_once().await, Some(1));
    let before = read_snapshot(&snapshot_path(&dir, "mockd")).unwrap();

    // Failed cycle: no new snapshot, prior one intact.
    assert_eq!(discovery.run_once().await, None);
    let after = read_snapshot(&snapshot_path(&dir, "mockd")).unwrap();
    assert_eq!(after.asof_ts_utc, before.asof_ts_utc);
    assert_eq!(after.count, 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_poller_reader_tracks_discovery_writes() {
    let dir = scratch_dir("handoff");
    let future = Utc::now().timestamp_millis() + 3_600_000;
    let a = instrument("A", future);
    let b = instrument("B", future);

    let mut discovery = discovery_with(
        &dir,
        vec![Ok(vec![a.clone()]), Ok(vec![a, b])],
    );
    let mut reader = SnapshotReader::new(snapshot_path(&dir, "mockd"));

    discovery.run_once().await;
    let first = reader.read_if_changed().unwrap().unwrap();
    assert_eq!(first.count, 1);

    // Unchanged file: no re-parse.
    assert!(reader.read_if_changed().unwrap().is_none());

    discovery.run_once().await;
    // mtime granularity may need a moment to move on coarse filesystems.
    let mut second = reader.read_if_changed().unwrap();
    if second.is_none() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        second = reader.read_if_changed().unwrap();
    }
    if let Some(set) = second {
        assert_eq!(set.count, 2);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_dedup_keeps_later_expiration() {
    let dir = scratch_dir("dedup");
    let now_ms = Utc::now().timestamp_millis();
    let short = instrument("A", now_ms + 60_000);
    let long = instrument("A", now_ms + 120_000);

    let mut discovery = discovery_with(&dir, vec![Ok(vec![short, long.clone()])]);
    assert_eq!(discovery.run_once().await, Some(1));

    let set = read_snapshot(&snapshot_path(&dir, "mockd")).unwrap();
    assert_eq!(set.count, 1);
    assert_eq!(set.instruments["mockd:A"].expiration_ms, long.expiration_ms);
    let _ = std::fs::remove_dir_all(&dir);
}
