//! Per-instrument exponential backoff with jitter.
//!
//! Deadlines live on the monotonic clock so wall-clock adjustments never
//! skip or delay polls. An entry exists only while an instrument is
//! failing: it is created on the first failure, deleted on success, and
//! garbage-collected when the instrument leaves the ActiveSet.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BackoffEntry {
    pub next_eligible_at: Instant,
    pub consecutive_failures: u32,
}

/// Raw exponential delay for the n-th consecutive failure (n >= 1), before
/// jitter: `min(base * 2^(n-1), cap)`.
pub fn base_delay(cfg: &BackoffConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    let scaled = cfg.base.saturating_mul(1u32 << exp.min(31));
    scaled.min(cfg.cap)
}

/// Apply a jitter factor in `[1 - jitter_frac, 1 + jitter_frac]`.
fn jittered(delay: Duration, jitter_frac: f64, unit: f64) -> Duration {
    let factor = 1.0 + jitter_frac * (2.0 * unit - 1.0);
    delay.mul_f64(factor.max(0.0))
}

/// The poller-local backoff table for one venue.
#[derive(Debug)]
pub struct BackoffMap {
    cfg: BackoffConfig,
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffMap {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self {
            cfg,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&BackoffEntry> {
        self.entries.get(key)
    }

    /// An instrument with no entry, or whose deadline has passed, may be
    /// dispatched.
    pub fn is_eligible(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) => now >= entry.next_eligible_at,
            None => true,
        }
    }

    /// Advance the failure count and compute the next eligibility deadline.
    /// Returns the applied delay.
    pub fn record_failure(&mut self, key: &str, now: Instant) -> Duration {
        let unit: f64 = rand::thread_rng().gen();
        self.record_failure_with_unit(key, now, unit)
    }

    /// Deterministic variant: `unit` in [0, 1] positions the jitter.
    pub fn record_failure_with_unit(&mut self, key: &str, now: Instant, unit: f64) -> Duration {
        let failures = self
            .entries
            .get(key)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
            .saturating_add(1);
        let delay = jittered(base_delay(&self.cfg, failures), self.cfg.jitter_frac, unit);
        self.entries.insert(
            key.to_string(),
            BackoffEntry {
                next_eligible_at: now + delay,
                consecutive_failures: failures,
            },
        );
        delay
    }

    /// Success resets the instrument entirely (equivalent to n = 0).
    pub fn record_success(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop entries whose instrument left the ActiveSet.
    pub fn retain_keys<F: Fn(&str) -> bool>(&mut self, known: F) {
        self.entries.retain(|key, _| known(key));
    }
}
