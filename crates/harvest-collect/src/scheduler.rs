//! Per-venue polling scheduler.
//!
//! One scheduler task per venue owns every piece of that venue's mutable
//! state: the cached ActiveSet, the backoff table, the AIMD controller, and
//! the log writers. Dispatch and result processing both happen here, so no
//! locking is needed and an instrument can never have two fetches in
//! flight: its key joins `in_flight_keys` at dispatch and leaves only when
//! the completion is processed.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use harvest_common::{Instrument, OrderbookRecord};
use harvest_market::{FetchError, NormalizeOptions, Normalizer, VenueClient};

use crate::aimd::{AimdController, AimdSettings, TickOutcome};
use crate::backoff::BackoffMap;
use crate::config::{BackoffConfig, PollerConfig, VenueConfig, WriterConfig};
use crate::jsonl::{RotatingJsonlWriter, WriteError};
use crate::snapshot::{snapshot_path, SnapshotError, SnapshotReader};
use crate::telemetry::{error_record, stats_record, ErrorSampler, StatsCounters};
use crate::workers::{FetchCompletion, WorkerPool};

/// Consecutive write failures tolerated on a stream before the process
/// gives up on it and exits non-zero.
const MAX_WRITE_FAILURES: u32 = 30;

pub struct VenueScheduler {
    venue: String,
    poller_cfg: PollerConfig,
    venue_cfg: VenueConfig,
    normalizer: Normalizer,
    normalize_opts: NormalizeOptions,

    reader: SnapshotReader,
    active: BTreeMap<String, Instrument>,
    snapshot_warned: bool,
    next_snapshot_read: Instant,

    backoff: BackoffMap,
    aimd: AimdController,
    pool: WorkerPool,
    in_flight_keys: HashSet<String>,

    books: RotatingJsonlWriter,
    stats: RotatingJsonlWriter,
    errors: RotatingJsonlWriter,
    write_failures: u32,

    counters: StatsCounters,
    sampler: ErrorSampler,
    next_stats: Instant,
}

impl VenueScheduler {
    pub fn new(
        venue_cfg: VenueConfig,
        poller_cfg: PollerConfig,
        writer_cfg: WriterConfig,
        backoff_cfg: BackoffConfig,
        clients: Vec<Arc<dyn VenueClient>>,
        normalizer: Normalizer,
        output_dir: &Path,
    ) -> Self {
        let venue = venue_cfg.name.clone();
        let venue_dir = output_dir.join(&venue);
        let now = Instant::now();
        Self {
            normalize_opts: NormalizeOptions {
                full_orderbook: venue_cfg.full_orderbook,
                include_raw: venue_cfg.include_raw,
            },
            reader: SnapshotReader::new(snapshot_path(output_dir, &venue)),
            active: BTreeMap::new(),
            snapshot_warned: false,
            next_snapshot_read: now,
            backoff: BackoffMap::new(backoff_cfg),
            aimd: AimdController::new(venue.as_str(), AimdSettings::from(&venue_cfg), now),
            pool: WorkerPool::new(clients, venue_cfg.request_timeout),
            in_flight_keys: HashSet::new(),
            books: RotatingJsonlWriter::new(
                venue_dir.join("orderbooks"),
                "orderbooks",
                writer_cfg.clone(),
            ),
            stats: RotatingJsonlWriter::new(
                venue_dir.join("poll_stats"),
                "stats",
                writer_cfg.clone(),
            ),
            errors: RotatingJsonlWriter::new(venue_dir.join("poll_errors"), "errors", writer_cfg),
            write_failures: 0,
            counters: StatsCounters::default(),
            sampler: ErrorSampler::new(poller_cfg.error_sample_per_sec, now),
            next_stats: now + poller_cfg.stats_interval,
            normalizer,
            poller_cfg,
            venue_cfg,
            venue,
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn inflight_limit(&self) -> usize {
        self.aimd.inflight_limit()
    }

    pub fn in_cooldown(&self) -> bool {
        self.aimd.in_cooldown(Instant::now())
    }

    pub fn backoff_failures(&self, key: &str) -> Option<u32> {
        self.backoff.get(key).map(|e| e.consecutive_failures)
    }

    /// Run the scheduler until shutdown, then drain and flush.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(
            venue = %self.venue,
            max_workers = self.pool.max_workers(),
            ceiling = self.venue_cfg.inflight_ceiling,
            "scheduler started"
        );
        loop {
            self.tick()?;
            tokio::select! {
                _ = tokio::time::sleep(self.poller_cfg.tick_interval) => {}
                _ = shutdown.recv() => {
                    info!(venue = %self.venue, "scheduler received shutdown signal");
                    break;
                }
            }
        }
        self.shutdown().await
    }

    /// One scheduler iteration. Public so tests can drive the loop
    /// deterministically.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();

        if now >= self.next_snapshot_read {
            self.refresh_snapshot();
            self.next_snapshot_read = now + self.poller_cfg.snapshot_read_interval;
        }

        // Backoff entries follow ActiveSet membership.
        let active = &self.active;
        self.backoff.retain_keys(|key| active.contains_key(key));

        if !self.aimd.in_cooldown(now) {
            self.dispatch_eligible(now);
        } else {
            debug!(
                venue = %self.venue,
                remaining_ms = self.aimd.cooldown_remaining(now).as_millis() as u64,
                "in cooldown; dispatch skipped"
            );
        }

        let outcome = self.drain_completions(now)?;
        self.aimd.on_tick(Instant::now(), &outcome);

        if Instant::now() >= self.next_stats {
            self.emit_stats()?;
            self.next_stats = Instant::now() + self.poller_cfg.stats_interval;
        }
        Ok(())
    }

    fn refresh_snapshot(&mut self) {
        match self.reader.read_if_changed() {
            Ok(Some(set)) => {
                debug!(
                    venue = %self.venue,
                    count = set.count,
                    asof = %set.asof_ts_utc,
                    "active set refreshed"
                );
                self.active = set.instruments;
                self.snapshot_warned = false;
            }
            Ok(None) => {}
            Err(err @ SnapshotError::Missing(_)) => {
                // Keep the last good (or empty) set and retry next cycle.
                if !self.snapshot_warned {
                    warn!(venue = %self.venue, %err, "snapshot not readable yet");
                    self.snapshot_warned = true;
                } else {
                    debug!(venue = %self.venue, %err, "snapshot still missing");
                }
            }
            Err(err) => {
                if !self.snapshot_warned {
                    warn!(venue = %self.venue, %err, "snapshot read failed; keeping last active set");
                    self.snapshot_warned = true;
                } else {
                    debug!(venue = %self.venue, %err, "snapshot read failed again");
                }
            }
        }
    }

    fn dispatch_eligible(&mut self, now: Instant) {
        let limit = self.aimd.inflight_limit();
        for (key, instrument) in &self.active {
            if self.pool.in_flight() >= limit || !self.pool.has_idle_worker() {
                break;
            }
            if self.in_flight_keys.contains(key) {
                continue;
            }
            if !self.backoff.is_eligible(key, now) {
                continue;
            }
            if self.pool.dispatch(instrument) {
                self.in_flight_keys.insert(key.clone());
                self.counters.on_submitted();
            }
        }
    }

    fn drain_completions(&mut self, now: Instant) -> anyhow::Result<TickOutcome> {
        let mut outcome = TickOutcome::default();
        while let Some(completion) = self.pool.try_recv() {
            self.process_completion(completion, now, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn process_completion(
        &mut self,
        completion: FetchCompletion,
        now: Instant,
        outcome: &mut TickOutcome,
    ) -> anyhow::Result<()> {
        let key = completion.instrument.instrument_key();
        self.in_flight_keys.remove(&key);

        let instrument = completion.instrument;
        let ts_ms = completion.ts_ms;
        let latency_ms = completion.latency_ms;
        let result = completion.result;

        let normalized: Result<OrderbookRecord, FetchError> = result.and_then(|raw| {
            (self.normalizer)(&raw, &instrument, ts_ms, &self.normalize_opts)
                .map_err(FetchError::from)
        });

        match normalized {
            Ok(record) => {
                let write = self.books.write(&record, ts_ms);
                self.note_write("orderbooks", write)?;
                self.backoff.record_success(&key);
                self.aimd.record_latency(latency_ms);
                self.counters.on_success();
                outcome.successes += 1;
            }
            Err(err) => {
                self.counters.on_failure(&err);
                if err.is_rate_limited() {
                    outcome.rate_limited += 1;
                } else {
                    outcome.failures += 1;
                }
                let delay = self.backoff.record_failure(&key, now);
                let failures = self
                    .backoff
                    .get(&key)
                    .map(|e| e.consecutive_failures)
                    .unwrap_or(0);
                debug!(
                    venue = %self.venue,
                    instrument = %key,
                    kind = err.kind(),
                    failures,
                    backoff_ms = delay.as_millis() as u64,
                    "fetch failed"
                );
                if self.sampler.allow(now) {
                    let record = error_record(&instrument, ts_ms, latency_ms, &err);
                    let write = self.errors.write(&record, ts_ms);
                    self.note_write("poll_errors", write)?;
                }
            }
        }
        Ok(())
    }

    fn emit_stats(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let ts_ms = Utc::now().timestamp_millis();
        let record = stats_record(
            &self.venue,
            ts_ms,
            self.active.len(),
            self.counters.take(),
            self.aimd.p50_latency_ms(),
            self.aimd.p95_latency_ms(),
            self.aimd.cooldown_remaining(now),
            self.aimd.inflight_limit(),
            self.pool.max_workers(),
        );
        let write = self.stats.write(&record, ts_ms);
        self.note_write("poll_stats", write)
    }

    /// Track write health: a stream error is logged and the handle reopens
    /// on the next write; a persistent streak escalates to process exit.
    fn note_write(&mut self, stream: &str, result: Result<(), WriteError>) -> anyhow::Result<()> {
        match result {
            Ok(()) => {
                self.write_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.write_failures += 1;
                error!(
                    venue = %self.venue,
                    stream,
                    failures = self.write_failures,
                    %err,
                    "log write failed"
                );
                if self.write_failures >= MAX_WRITE_FAILURES {
                    Err(anyhow::Error::from(err)
                        .context(format!("persistent write failures on {stream}")))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drain inflight fetches up to the grace period, process what
    /// completed, then flush and fsync every stream.
    async fn shutdown(mut self) -> anyhow::Result<()> {
        let drained = self.pool.drain(self.poller_cfg.shutdown_grace).await;
        let abandoned = self.pool.in_flight();
        let now = Instant::now();
        let mut outcome = TickOutcome::default();
        for completion in drained {
            self.process_completion(completion, now, &mut outcome)?;
        }
        if abandoned > 0 {
            warn!(venue = %self.venue, abandoned, "abandoning inflight fetches past grace period");
        }

        self.emit_stats()?;
        self.books.close()?;
        self.stats.close()?;
        self.errors.close()?;
        info!(venue = %self.venue, "scheduler stopped");
        Ok(())
    }
}
