//! Per-venue AIMD congestion control over the inflight fetch limit.
//!
//! Single control variable: `inflight_limit` in `[1, ceiling]`. Any HTTP
//! 429 halves the limit immediately and puts the venue in cooldown; high
//! failure rate or high p95 latency without a 429 decrements it; a
//! sustained clean window earns an additive increase. The controller is
//! purely reactive and keeps no state across restarts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::VenueConfig;

/// How many latency samples the rolling window keeps.
const LATENCY_WINDOW: usize = 128;

/// One tick's aggregated fetch outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub successes: u32,
    pub failures: u32,
    pub rate_limited: u32,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.successes == 0 && self.failures == 0 && self.rate_limited == 0
    }
}

/// AIMD thresholds, lifted out of the venue config.
#[derive(Debug, Clone)]
pub struct AimdSettings {
    pub ceiling: usize,
    pub cooldown_on_429: Duration,
    pub high_fail_rate: f64,
    pub high_latency: Duration,
    pub low_latency: Duration,
    pub stable_for: Duration,
    pub min_adjust_interval: Duration,
}

impl From<&VenueConfig> for AimdSettings {
    fn from(cfg: &VenueConfig) -> Self {
        Self {
            ceiling: cfg.inflight_ceiling,
            cooldown_on_429: cfg.cooldown_on_429,
            high_fail_rate: cfg.high_fail_rate,
            high_latency: cfg.high_latency,
            low_latency: cfg.low_latency,
            stable_for: cfg.stable_for,
            min_adjust_interval: cfg.min_adjust_interval,
        }
    }
}

#[derive(Debug)]
pub struct AimdController {
    venue: String,
    settings: AimdSettings,
    limit: usize,
    cooldown_until: Option<Instant>,
    /// Start of the current stability window; reset on every decrease.
    window_started: Instant,
    window_successes: u64,
    window_failures: u64,
    last_adjust: Instant,
    latencies_ms: VecDeque<u64>,
}

impl AimdController {
    pub fn new(venue: impl Into<String>, settings: AimdSettings, now: Instant) -> Self {
        let ceiling = settings.ceiling.max(1);
        Self {
            venue: venue.into(),
            limit: ceiling,
            settings: AimdSettings { ceiling, ..settings },
            cooldown_until: None,
            window_started: now,
            window_successes: 0,
            window_failures: 0,
            last_adjust: now,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    pub fn inflight_limit(&self) -> usize {
        self.limit
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.cooldown_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }

    pub fn record_latency(&mut self, latency_ms: u64) {
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    pub fn p50_latency_ms(&self) -> Option<u64> {
        percentile(&self.latencies_ms, 0.50)
    }

    pub fn p95_latency_ms(&self) -> Option<u64> {
        percentile(&self.latencies_ms, 0.95)
    }

    fn fail_rate(&self) -> f64 {
        let attempts = self.window_successes + self.window_failures;
        if attempts == 0 {
            return 0.0;
        }
        self.window_failures as f64 / attempts as f64
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_started = now;
        self.window_successes = 0;
        self.window_failures = 0;
    }

    /// Evaluate the control rules once, after a tick's results have been
    /// processed. Rate-limit responses dominate every other signal.
    pub fn on_tick(&mut self, now: Instant, outcome: &TickOutcome) {
        self.window_successes += outcome.successes as u64;
        self.window_failures += (outcome.failures + outcome.rate_limited) as u64;

        if outcome.rate_limited > 0 {
            let previous = self.limit;
            self.limit = (self.limit / 2).max(1);
            self.cooldown_until = Some(now + self.settings.cooldown_on_429);
            self.last_adjust = now;
            self.reset_window(now);
            info!(
                venue = %self.venue,
                previous,
                limit = self.limit,
                cooldown_ms = self.settings.cooldown_on_429.as_millis() as u64,
                "rate limited: halving inflight limit"
            );
            return;
        }

        let fail_rate = self.fail_rate();
        let p95 = self.p95_latency_ms();

        if fail_rate >= self.settings.high_fail_rate && self.window_failures > 0 {
            if self.limit > 1 {
                self.limit -= 1;
                self.last_adjust = now;
                info!(venue = %self.venue, fail_rate, limit = self.limit, "high failure rate: decreasing inflight limit");
            }
            self.reset_window(now);
            return;
        }

        if let Some(p95_ms) = p95 {
            if Duration::from_millis(p95_ms) >= self.settings.high_latency {
                if self.limit > 1 {
                    self.limit -= 1;
                    self.last_adjust = now;
                    info!(venue = %self.venue, p95_ms, limit = self.limit, "high latency: decreasing inflight limit");
                }
                self.reset_window(now);
                return;
            }
        }

        // Additive increase: a clean, populated window that has lasted
        // stable_for, with the adjust interval respected.
        let attempts = self.window_successes + self.window_failures;
        if self.limit < self.settings.ceiling
            && attempts > 0
            && now.duration_since(self.window_started) >= self.settings.stable_for
            && fail_rate < self.settings.high_fail_rate / 2.0
            && p95.map_or(true, |ms| Duration::from_millis(ms) < self.settings.low_latency)
            && now.duration_since(self.last_adjust) >= self.settings.min_adjust_interval
        {
            self.limit += 1;
            self.last_adjust = now;
            debug!(venue = %self.venue, limit = self.limit, "stable window: increasing inflight limit");
        }
    }
}

/// Nearest-rank percentile over the rolling window.
fn percentile(samples: &VecDeque<u64>, q: f64) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}
