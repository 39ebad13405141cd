//! Instrument data model shared by the discovery and polling processes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Outcome type for binary markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One price level of an order book ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// A single pollable order-book stream at a venue.
///
/// `venue` + `poll_key` form the globally unique `instrument_key`. The
/// `poll_key` is the opaque venue-native identifier used to fetch the book
/// (a market slug for single-book venues, a token id for dual-book venues).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub venue: String,
    pub poll_key: String,
    pub market_id: String,
    /// Expiration as epoch milliseconds UTC. Required; discovery drops
    /// instruments past expiration.
    pub expiration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    /// Name of the discovery rule that produced this instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Small venue-specific bag; passed through to the markets log verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Instrument {
    /// Primary key: `"<venue>:<poll_key>"`, stable across discovery runs.
    pub fn instrument_key(&self) -> String {
        format!("{}:{}", self.venue, self.poll_key)
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.venue, self.poll_key)
    }
}

/// The set of instruments a venue should currently poll.
///
/// Produced whole by each discovery run (never merged) and handed to the
/// poller through the atomic snapshot file. The `BTreeMap` keying gives
/// deterministic dispatch order for a given snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSet {
    pub asof_ts_utc: DateTime<Utc>,
    pub venue: String,
    pub count: usize,
    pub instruments: BTreeMap<String, Instrument>,
}

impl ActiveSet {
    pub fn new(venue: impl Into<String>, asof: DateTime<Utc>) -> Self {
        Self {
            asof_ts_utc: asof,
            venue: venue.into(),
            count: 0,
            instruments: BTreeMap::new(),
        }
    }

    /// Build a set from discovered instruments: expired entries (relative to
    /// `cutoff_ms`) are dropped, duplicates collapse to the entry with the
    /// later `expiration_ms`.
    pub fn from_discovered(
        venue: impl Into<String>,
        asof: DateTime<Utc>,
        discovered: Vec<Instrument>,
        cutoff_ms: i64,
    ) -> Self {
        let mut set = Self::new(venue, asof);
        for inst in discovered {
            if inst.expiration_ms <= cutoff_ms {
                continue;
            }
            let key = inst.instrument_key();
            match set.instruments.get(&key) {
                Some(existing) if existing.expiration_ms >= inst.expiration_ms => {}
                _ => {
                    set.instruments.insert(key, inst);
                }
            }
        }
        set.count = set.instruments.len();
        set
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.instruments.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(venue: &str, poll_key: &str, expiration_ms: i64) -> Instrument {
        Instrument {
            venue: venue.to_string(),
            poll_key: poll_key.to_string(),
            market_id: "m1".to_string(),
            expiration_ms,
            slug: None,
            title: None,
            outcome: None,
            underlying: None,
            rule: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_instrument_key() {
        let i = inst("v1", "A", 1_000);
        assert_eq!(i.instrument_key(), "v1:A");
    }

    #[test]
    fn test_from_discovered_drops_expired() {
        let set = ActiveSet::from_discovered(
            "v1",
            Utc::now(),
            vec![inst("v1", "live", 2_000), inst("v1", "dead", 1_000)],
            1_000,
        );
        assert_eq!(set.count, 1);
        assert!(set.contains_key("v1:live"));
        assert!(!set.contains_key("v1:dead"));
    }

    #[test]
    fn test_from_discovered_dedupes_by_later_expiration() {
        let set = ActiveSet::from_discovered(
            "v1",
            Utc::now(),
            vec![inst("v1", "A", 2_000), inst("v1", "A", 5_000), inst("v1", "A", 3_000)],
            0,
        );
        assert_eq!(set.count, 1);
        assert_eq!(set.instruments["v1:A"].expiration_ms, 5_000);
    }

    #[test]
    fn test_instrument_roundtrip_with_extra() {
        let mut i = inst("v1", "A", 9_000);
        i.extra
            .insert("conditionId".to_string(), serde_json::json!("0xabc"));
        let json = serde_json::to_string(&i).unwrap();
        let back: Instrument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, i);
    }
}
