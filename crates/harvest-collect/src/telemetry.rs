//! Poller telemetry: delta counters for the stats stream and a rate-capped
//! sampler for the error stream.

use std::time::{Duration, Instant};

use harvest_common::{Instrument, PollErrorRecord, PollStatsRecord, SCHEMA_VERSION};
use harvest_market::FetchError;

/// Maximum characters kept from an error message.
const ERROR_MESSAGE_MAX: usize = 256;

/// Counters accumulated between stats emissions. All values are deltas.
#[derive(Debug, Default, Clone)]
pub struct StatsCounters {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_429: u64,
    pub timeouts: u64,
}

impl StatsCounters {
    pub fn on_submitted(&mut self) {
        self.submitted += 1;
    }

    pub fn on_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn on_failure(&mut self, err: &FetchError) {
        self.failed += 1;
        match err {
            FetchError::RateLimited => self.http_429 += 1,
            FetchError::Http4xx(_) => self.http_4xx += 1,
            FetchError::Http5xx(_) => self.http_5xx += 1,
            FetchError::Timeout => self.timeouts += 1,
            FetchError::Network(_) | FetchError::Parse(_) => {}
        }
    }

    /// Take the current deltas, resetting for the next window.
    pub fn take(&mut self) -> StatsCounters {
        std::mem::take(self)
    }
}

/// Build one stats record from the current window.
#[allow(clippy::too_many_arguments)]
pub fn stats_record(
    venue: &str,
    ts_ms: i64,
    active_count: usize,
    counters: StatsCounters,
    p50_latency_ms: Option<u64>,
    p95_latency_ms: Option<u64>,
    cooldown_remaining: Duration,
    inflight_limit: usize,
    max_workers: usize,
) -> PollStatsRecord {
    PollStatsRecord {
        record_type: "poll_stats".to_string(),
        schema_version: SCHEMA_VERSION,
        venue: venue.to_string(),
        ts_ms,
        active_count,
        submitted: counters.submitted,
        succeeded: counters.succeeded,
        failed: counters.failed,
        http_4xx: counters.http_4xx,
        http_5xx: counters.http_5xx,
        http_429: counters.http_429,
        timeouts: counters.timeouts,
        p50_latency_ms,
        p95_latency_ms,
        cooldown_remaining_ms: cooldown_remaining.as_millis() as u64,
        inflight_limit,
        max_workers,
    }
}

/// Truncate a message to the wire limit on a character boundary.
fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(ERROR_MESSAGE_MAX) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Build one sampled error record.
pub fn error_record(
    instrument: &Instrument,
    ts_ms: i64,
    latency_ms: u64,
    err: &FetchError,
) -> PollErrorRecord {
    PollErrorRecord {
        record_type: "poll_error".to_string(),
        schema_version: SCHEMA_VERSION,
        venue: instrument.venue.clone(),
        ts_ms,
        instrument_key: instrument.instrument_key(),
        market_id: instrument.market_id.clone(),
        slug: instrument.slug.clone(),
        http_status: err.http_status(),
        latency_ms,
        error_kind: err.kind().to_string(),
        message: truncate_message(&err.to_string()),
    }
}

/// Per-venue cap on error records per second. The error stream is
/// diagnostic; under a venue-wide outage it must not swamp the disk.
#[derive(Debug)]
pub struct ErrorSampler {
    per_sec_cap: u32,
    window_start: Instant,
    emitted: u32,
}

impl ErrorSampler {
    pub fn new(per_sec_cap: u32, now: Instant) -> Self {
        Self {
            per_sec_cap,
            window_start: now,
            emitted: 0,
        }
    }

    /// Whether one more error record may be emitted right now.
    pub fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.emitted = 0;
        }
        if self.emitted < self.per_sec_cap {
            self.emitted += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_route_by_kind() {
        let mut counters = StatsCounters::default();
        counters.on_submitted();
        counters.on_submitted();
        counters.on_success();
        counters.on_failure(&FetchError::RateLimited);
        counters.on_failure(&FetchError::Http4xx(404));
        counters.on_failure(&FetchError::Http5xx(503));
        counters.on_failure(&FetchError::Timeout);
        counters.on_failure(&FetchError::Network("reset".to_string()));

        assert_eq!(counters.submitted, 2);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.failed, 5);
        assert_eq!(counters.http_429, 1);
        assert_eq!(counters.http_4xx, 1);
        assert_eq!(counters.http_5xx, 1);
        assert_eq!(counters.timeouts, 1);

        let taken = counters.take();
        assert_eq!(taken.failed, 5);
        assert_eq!(counters.failed, 0);
    }

    #[test]
    fn test_sampler_caps_per_second() {
        let now = Instant::now();
        let mut sampler = ErrorSampler::new(3, now);
        assert!(sampler.allow(now));
        assert!(sampler.allow(now));
        assert!(sampler.allow(now));
        assert!(!sampler.allow(now));

        // The cap resets in the next one-second window.
        let later = now + Duration::from_millis(1_001);
        assert!(sampler.allow(later));
    }

    #[test]
    fn test_message_truncated() {
        let long = "x".repeat(1_000);
        let err = FetchError::Network(long);
        let inst = Instrument {
            venue: "v1".to_string(),
            poll_key: "A".to_string(),
            market_id: "m1".to_string(),
            expiration_ms: 0,
            slug: None,
            title: None,
            outcome: None,
            underlying: None,
            rule: None,
            extra: Default::default(),
        };
        let rec = error_record(&inst, 1, 12, &err);
        assert_eq!(rec.message.chars().count(), 256);
        assert_eq!(rec.error_kind, "network");
        assert_eq!(rec.http_status, None);
        assert_eq!(rec.instrument_key, "v1:A");
    }
}
