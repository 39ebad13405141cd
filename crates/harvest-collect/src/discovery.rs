//! Per-venue discovery loop.
//!
//! On a slow cadence: discover instruments, build a fresh ActiveSet
//! (expired entries dropped, duplicates collapsed), diff it against the
//! previously written set, append a market record per added-or-changed
//! instrument, and atomically replace the snapshot. A failed discovery
//! skips the snapshot write for that cycle and never touches the last good
//! file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use harvest_common::{ActiveSet, Instrument, MarketRecord};
use harvest_market::VenueClient;

use crate::config::{DiscoveryConfig, WriterConfig};
use crate::jsonl::RotatingJsonlWriter;
use crate::snapshot::{snapshot_path, write_snapshot};

/// Discovery loop state for one venue.
pub struct VenueDiscovery {
    venue: String,
    client: Arc<dyn VenueClient>,
    cfg: DiscoveryConfig,
    snapshot_path: PathBuf,
    markets: RotatingJsonlWriter,
    /// Instruments as of the last successfully written snapshot; the diff
    /// baseline for membership logging.
    last_written: Option<BTreeMap<String, Instrument>>,
}

impl VenueDiscovery {
    pub fn new(
        client: Arc<dyn VenueClient>,
        cfg: DiscoveryConfig,
        writer_cfg: WriterConfig,
        output_dir: &Path,
    ) -> Self {
        let venue = client.venue().to_string();
        let venue_dir = output_dir.join(&venue);
        Self {
            snapshot_path: snapshot_path(output_dir, &venue),
            markets: RotatingJsonlWriter::new(venue_dir.join("markets"), "markets", writer_cfg),
            last_written: None,
            venue,
            client,
            cfg,
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// One discovery cycle. Returns the number of market records appended,
    /// or `None` when discovery failed and the snapshot was left untouched.
    pub async fn run_once(&mut self) -> Option<usize> {
        let discovered = match self.client.discover().await {
            Ok(instruments) => instruments,
            Err(err) => {
                warn!(venue = %self.venue, %err, "discovery failed; skipping snapshot this cycle");
                return None;
            }
        };

        let asof = Utc::now();
        let grace_ms = self.cfg.expire_grace.as_millis() as i64;
        let cutoff_ms = asof.timestamp_millis() - grace_ms;
        let set = ActiveSet::from_discovered(self.venue.clone(), asof, discovered, cutoff_ms);

        let changed = self.diff_changed(&set.instruments);
        let ts_ms = asof.timestamp_millis();
        let mut logged_cleanly = true;
        for instrument in &changed {
            let record = MarketRecord::from_instrument(instrument, ts_ms);
            if let Err(err) = self.markets.write(&record, ts_ms) {
                // Markets stream trouble must not block the snapshot.
                error!(venue = %self.venue, %err, "markets log write failed");
                logged_cleanly = false;
                break;
            }
        }

        let snapshot_written = self.write_fresh_snapshot(&set);
        // The diff baseline only advances on a fully clean cycle, so
        // un-logged changes are retried next round (duplicates on the
        // opposite partial failure are harmless).
        if snapshot_written && logged_cleanly {
            self.last_written = Some(set.instruments.clone());
        }
        if !changed.is_empty() {
            info!(
                venue = %self.venue,
                added_or_changed = changed.len(),
                active = set.count,
                "active set changed"
            );
        } else {
            debug!(venue = %self.venue, active = set.count, "active set unchanged");
        }
        Some(changed.len())
    }

    /// Instruments that are new or whose fields differ from the last
    /// written set. Removals are intentionally not logged.
    fn diff_changed(&self, current: &BTreeMap<String, Instrument>) -> Vec<Instrument> {
        current
            .iter()
            .filter(|(key, inst)| match &self.last_written {
                Some(previous) => previous.get(key.as_str()) != Some(*inst),
                None => true,
            })
            .map(|(_, inst)| inst.clone())
            .collect()
    }

    fn write_fresh_snapshot(&mut self, set: &ActiveSet) -> bool {
        match write_snapshot(&self.snapshot_path, set) {
            Ok(()) => {
                debug!(
                    venue = %self.venue,
                    count = set.count,
                    path = %self.snapshot_path.display(),
                    "snapshot written"
                );
                true
            }
            Err(err) => {
                error!(venue = %self.venue, %err, "snapshot write failed; poller keeps prior set");
                false
            }
        }
    }

    /// Run discovery on its cadence until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(
            venue = %self.venue,
            interval_secs = self.cfg.interval.as_secs(),
            "discovery started"
        );
        loop {
            let started = std::time::Instant::now();
            self.run_once().await;

            // Keep the cadence net of the cycle's own duration.
            let elapsed = started.elapsed();
            let sleep_for = self
                .cfg
                .interval
                .checked_sub(elapsed)
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.recv() => {
                    info!(venue = %self.venue, "discovery received shutdown signal");
                    break;
                }
            }
        }
        self.markets.close()?;
        info!(venue = %self.venue, "discovery stopped");
        Ok(())
    }
}
