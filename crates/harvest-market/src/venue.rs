//! The venue client seam: discovery + order-book fetch, with the error
//! taxonomy the poller's backoff and AIMD control react to.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use harvest_common::{Instrument, OrderbookRecord, PriceLevel};

/// A raw order-book payload as returned by a venue, before normalization.
#[derive(Debug, Clone)]
pub struct RawBook {
    pub payload: serde_json::Value,
    /// Venue-reported "as of" time in epoch ms, when the payload carries one.
    pub ob_ts_ms: Option<i64>,
}

/// Errors from a single order-book fetch, categorized so the scheduler can
/// route them: 429 feeds the AIMD halving path, everything else advances
/// per-instrument backoff.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP 429 rate limited")]
    RateLimited,

    #[error("HTTP {0}")]
    Http4xx(u16),

    #[error("HTTP {0}")]
    Http5xx(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Map an HTTP status to the matching category; `None` for success codes.
    pub fn from_status(status: reqwest::StatusCode) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        let code = status.as_u16();
        Some(match code {
            429 => FetchError::RateLimited,
            400..=499 => FetchError::Http4xx(code),
            500..=599 => FetchError::Http5xx(code),
            _ => FetchError::Network(format!("unexpected status {code}")),
        })
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited)
    }

    /// Stable label for telemetry records.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimited => "http_429",
            FetchError::Http4xx(_) => "http_4xx",
            FetchError::Http5xx(_) => "http_5xx",
            FetchError::Timeout => "timeout",
            FetchError::Network(_) => "network",
            FetchError::Parse(_) => "parse",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::RateLimited => Some(429),
            FetchError::Http4xx(code) | FetchError::Http5xx(code) => Some(*code),
            _ => None,
        }
    }
}

/// Errors from a discovery run. Discovery failures never touch the snapshot;
/// the venue's cycle is skipped and retried at the next cadence.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid market data: {0}")]
    InvalidData(String),
}

/// Normalization failure; the scheduler treats it as a fetch failure.
#[derive(Debug, Error)]
#[error("normalize failed: {0}")]
pub struct NormalizeError(pub String);

impl From<NormalizeError> for FetchError {
    fn from(err: NormalizeError) -> Self {
        FetchError::Parse(err.0)
    }
}

/// Options a venue normalizer honors.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// When false, only the best level per side is kept in `bids`/`asks`.
    pub full_orderbook: bool,
    /// When true, the raw venue payload rides along in `raw`.
    pub include_raw: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            full_orderbook: true,
            include_raw: false,
        }
    }
}

/// Pure per-venue normalization function: raw payload in, wire record out.
pub type Normalizer =
    fn(&RawBook, &Instrument, i64, &NormalizeOptions) -> Result<OrderbookRecord, NormalizeError>;

/// A venue integration. Discovery rules are opaque venue configuration,
/// injected at construction; `discover` applies them.
///
/// Implementations must be safe to call from concurrent fetch tasks; the
/// worker pool builds one isolated instance per worker so each holds its own
/// HTTP connection pool.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Short venue identifier, e.g. `"limitless"`.
    fn venue(&self) -> &str;

    /// Discover the instruments this venue should currently poll.
    async fn discover(&self) -> Result<Vec<Instrument>, DiscoveryError>;

    /// Fetch one raw order-book payload by its venue-native poll key.
    async fn get_orderbook(&self, poll_key: &str) -> Result<RawBook, FetchError>;
}

/// Parse a price/size value that may be a JSON string or number.
pub(crate) fn decimal_field(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Parse a `[{price, size}, ...]` ladder out of a raw payload field.
pub(crate) fn parse_levels(value: Option<&serde_json::Value>) -> Vec<PriceLevel> {
    let Some(serde_json::Value::Array(entries)) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let price = decimal_field(entry.get("price")?)?;
            let size = decimal_field(entry.get("size")?)?;
            Some(PriceLevel { price, size })
        })
        .collect()
}

/// Derived book summary used by both normalizers: best levels, mid, spread.
pub(crate) fn book_summary(
    bids: &[PriceLevel],
    asks: &[PriceLevel],
) -> (
    Option<PriceLevel>,
    Option<PriceLevel>,
    Option<Decimal>,
    Option<Decimal>,
) {
    let best_bid = bids.iter().max_by_key(|l| l.price).cloned();
    let best_ask = asks.iter().min_by_key(|l| l.price).cloned();
    let (mid, spread) = match (&best_bid, &best_ask) {
        (Some(bb), Some(ba)) => (
            Some((bb.price + ba.price) / Decimal::TWO),
            Some(ba.price - bb.price),
        ),
        _ => (None, None),
    };
    (best_bid, best_ask, mid, spread)
}
