//! Wire records appended to the JSONL logs.
//!
//! Schema evolution rules: new optional fields may be added without bumping
//! `SCHEMA_VERSION`; renaming or removing a required field requires a new
//! version. Readers ignore unknown fields and treat a missing
//! `schema_version` as 0 (legacy, best-effort).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Instrument, Outcome, PriceLevel};

/// Current wire schema version for all emitted records.
pub const SCHEMA_VERSION: u32 = 1;

/// One order-book observation for a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookRecord {
    pub record_type: String,
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub poll_key: String,
    /// The instrument key (`"<venue>:<poll_key>"`).
    pub instrument_id: String,
    /// Collector capture time: wall clock at fetch start, epoch ms UTC.
    pub ts_ms: i64,
    /// Venue-reported "as of" time, when the venue provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ob_ts_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bids: Option<Vec<PriceLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asks: Option<Vec<PriceLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<PriceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<PriceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<Decimal>,
    /// Raw venue payload passthrough, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl OrderbookRecord {
    pub fn new(instrument: &Instrument, ts_ms: i64) -> Self {
        Self {
            record_type: "orderbook".to_string(),
            schema_version: SCHEMA_VERSION,
            venue: instrument.venue.clone(),
            poll_key: instrument.poll_key.clone(),
            instrument_id: instrument.instrument_key(),
            ts_ms,
            ob_ts_ms: None,
            bids: None,
            asks: None,
            best_bid: None,
            best_ask: None,
            mid: None,
            spread: None,
            raw: None,
        }
    }
}

/// Instrument membership / metadata record, appended when discovery observes
/// a new or changed instrument. Removals are not logged; they are derivable
/// from absence in a later snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRecord {
    pub record_type: String,
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub poll_key: String,
    pub instrument_id: String,
    pub market_id: String,
    pub expiration_ms: i64,
    /// Discovery observation time, epoch ms UTC.
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

impl MarketRecord {
    pub fn from_instrument(instrument: &Instrument, ts_ms: i64) -> Self {
        Self {
            record_type: "market".to_string(),
            schema_version: SCHEMA_VERSION,
            venue: instrument.venue.clone(),
            poll_key: instrument.poll_key.clone(),
            instrument_id: instrument.instrument_key(),
            market_id: instrument.market_id.clone(),
            expiration_ms: instrument.expiration_ms,
            ts_ms,
            slug: instrument.slug.clone(),
            title: instrument.title.clone(),
            outcome: instrument.outcome,
            underlying: instrument.underlying.clone(),
            rule: instrument.rule.clone(),
            extra: instrument.extra.clone(),
        }
    }
}

/// Rolling poller health record, emitted per venue on a fixed interval.
/// All counters are deltas since the previous emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollStatsRecord {
    pub record_type: String,
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub ts_ms: i64,
    pub active_count: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_429: u64,
    pub timeouts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_latency_ms: Option<u64>,
    pub cooldown_remaining_ms: u64,
    pub inflight_limit: usize,
    pub max_workers: usize,
}

/// Sampled fetch-failure diagnostic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollErrorRecord {
    pub record_type: String,
    #[serde(default)]
    pub schema_version: u32,
    pub venue: String,
    pub ts_ms: i64,
    pub instrument_key: String,
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub error_kind: String,
    /// Truncated to 256 characters at the source.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_orderbook_record_defaults() {
        let inst = Instrument {
            venue: "v1".to_string(),
            poll_key: "A".to_string(),
            market_id: "m1".to_string(),
            expiration_ms: 1_700_000_000_000,
            slug: None,
            title: None,
            outcome: None,
            underlying: None,
            rule: None,
            extra: Default::default(),
        };
        let rec = OrderbookRecord::new(&inst, 42);
        assert_eq!(rec.record_type, "orderbook");
        assert_eq!(rec.schema_version, SCHEMA_VERSION);
        assert_eq!(rec.instrument_id, "v1:A");

        let json = serde_json::to_string(&rec).unwrap();
        // Optional fields must not appear on the wire when unset.
        assert!(!json.contains("ob_ts_ms"));
        assert!(!json.contains("best_bid"));
    }

    #[test]
    fn test_reader_ignores_unknown_fields() {
        let json = r#"{
            "record_type": "orderbook",
            "schema_version": 1,
            "venue": "v1",
            "poll_key": "A",
            "instrument_id": "v1:A",
            "ts_ms": 1700000000000,
            "mid": "0.55",
            "some_future_field": {"nested": true}
        }"#;
        let rec: OrderbookRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.instrument_id, "v1:A");
        assert_eq!(rec.mid, Some(dec!(0.55)));
    }

    #[test]
    fn test_missing_schema_version_is_legacy_zero() {
        let json = r#"{
            "record_type": "orderbook",
            "venue": "v1",
            "poll_key": "A",
            "instrument_id": "v1:A",
            "ts_ms": 1
        }"#;
        let rec: OrderbookRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.schema_version, 0);
    }
}
