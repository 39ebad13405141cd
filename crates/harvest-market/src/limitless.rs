//! Limitless venue integration.
//!
//! Limitless is a single-book CLOB venue: YES and NO share one order book,
//! so discovery emits one instrument per market and books are fetched by
//! market slug (`/markets/{slug}/orderbook`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use harvest_common::{Instrument, OrderbookRecord};

use crate::rules::LimitlessRules;
use crate::venue::{
    book_summary, parse_levels, DiscoveryError, FetchError, NormalizeError, NormalizeOptions,
    RawBook, VenueClient,
};

pub const VENUE: &str = "limitless";

/// Default Limitless REST base URL.
const DEFAULT_BASE_URL: &str = "https://api.limitless.exchange";

/// Connection settings for the Limitless client.
#[derive(Debug, Clone)]
pub struct LimitlessSettings {
    pub base_url: String,
    /// Optional bearer token; most endpoints are public.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub rules: LimitlessRules,
}

impl Default for LimitlessSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(5),
            rules: LimitlessRules::default(),
        }
    }
}

/// Raw market entry from `/markets/active`. Unknown fields are ignored;
/// the whole object also rides along as `raw` for filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveMarket {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    trade_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    expired: Option<bool>,
    #[serde(default)]
    expiration_timestamp: Option<i64>,
    #[serde(default)]
    tokens: Option<serde_json::Value>,
}

impl ActiveMarket {
    /// Only CLOB markets with tokens, a live status, and an expiration are
    /// pollable order-book streams.
    fn is_loggable(&self) -> bool {
        if self.trade_type.as_deref() != Some("clob") {
            return false;
        }
        match &self.tokens {
            Some(serde_json::Value::Array(t)) if !t.is_empty() => {}
            Some(serde_json::Value::Object(t)) if !t.is_empty() => {}
            _ => return false,
        }
        if self.expired == Some(true) {
            return false;
        }
        if !matches!(self.status.as_deref(), Some("FUNDED") | Some("ACTIVE")) {
            return false;
        }
        self.slug.is_some() && self.expiration_timestamp.is_some()
    }

    fn matches_underlying(&self, symbol: &str) -> bool {
        let upper = symbol.to_uppercase();
        let ticker = self.ticker.as_deref().unwrap_or("").to_uppercase();
        let title = self.title.as_deref().unwrap_or("").to_uppercase();
        ticker.contains(&upper) || title.contains(&upper)
    }
}

/// Limitless REST client. One instance per worker; each holds its own
/// connection pool.
pub struct LimitlessClient {
    http: reqwest::Client,
    settings: LimitlessSettings,
}

impl LimitlessClient {
    pub fn new(settings: LimitlessSettings) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(settings.request_timeout);
        if let Some(key) = &settings.api_key {
            let mut headers = reqwest::header::HeaderMap::new();
            if let Ok(value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
            {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
            builder = builder.default_headers(headers);
        }
        Ok(Self {
            http: builder.build()?,
            settings,
        })
    }

    async fn list_active_markets(&self) -> Result<Vec<ActiveMarket>, DiscoveryError> {
        let url = format!("{}/markets/active", self.settings.base_url);
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let payload: serde_json::Value = response.json().await?;

        // The endpoint wraps the list in `{"data": [...]}` but has also been
        // observed returning a bare array.
        let entries = match &payload {
            serde_json::Value::Object(map) => map.get("data").cloned().unwrap_or_default(),
            other => other.clone(),
        };
        let markets: Vec<ActiveMarket> = serde_json::from_value(entries)?;
        Ok(markets)
    }
}

#[async_trait]
impl VenueClient for LimitlessClient {
    fn venue(&self) -> &str {
        VENUE
    }

    async fn discover(&self) -> Result<Vec<Instrument>, DiscoveryError> {
        let markets = self.list_active_markets().await?;
        debug!(count = markets.len(), "limitless active markets fetched");

        let mut instruments = Vec::new();
        for underlying in &self.settings.rules.underlyings {
            let mut kept = 0usize;
            for market in markets
                .iter()
                .filter(|m| m.is_loggable() && m.matches_underlying(underlying))
            {
                if kept >= self.settings.rules.max_markets_per_underlying {
                    break;
                }
                // is_loggable guarantees slug and expiration are present.
                let slug = market.slug.clone().unwrap_or_default();
                let expiration_ms = market.expiration_timestamp.unwrap_or_default();
                let market_id = market
                    .id
                    .as_ref()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| slug.clone());

                let mut extra = BTreeMap::new();
                if let Some(status) = &market.status {
                    extra.insert("status".to_string(), serde_json::json!(status));
                }

                instruments.push(Instrument {
                    venue: VENUE.to_string(),
                    poll_key: slug.clone(),
                    market_id,
                    expiration_ms,
                    slug: Some(slug),
                    title: market.title.clone(),
                    outcome: None,
                    underlying: Some(underlying.to_uppercase()),
                    rule: None,
                    extra,
                });
                kept += 1;
            }
        }
        Ok(instruments)
    }

    async fn get_orderbook(&self, poll_key: &str) -> Result<RawBook, FetchError> {
        let url = format!("{}/markets/{}/orderbook", self.settings.base_url, poll_key);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        if let Some(err) = FetchError::from_status(response.status()) {
            return Err(err);
        }

        let payload: serde_json::Value =
            response.json().await.map_err(FetchError::from_reqwest)?;
        Ok(RawBook {
            payload,
            ob_ts_ms: None,
        })
    }
}

/// Normalize a raw Limitless book into the wire record.
///
/// The payload carries `bids`/`asks` ladders plus venue extras
/// (`adjustedMidpoint`, `lastTradePrice`) that are preserved only when the
/// raw passthrough is enabled.
pub fn normalize_orderbook(
    raw: &RawBook,
    instrument: &Instrument,
    ts_ms: i64,
    opts: &NormalizeOptions,
) -> Result<OrderbookRecord, NormalizeError> {
    let payload = raw
        .payload
        .as_object()
        .ok_or_else(|| NormalizeError("orderbook payload is not an object".to_string()))?;

    let bids = parse_levels(payload.get("bids"));
    let asks = parse_levels(payload.get("asks"));
    let (best_bid, best_ask, mid, spread) = book_summary(&bids, &asks);

    let mut record = OrderbookRecord::new(instrument, ts_ms);
    record.ob_ts_ms = raw.ob_ts_ms;
    record.bids = Some(if opts.full_orderbook {
        bids
    } else {
        best_bid.clone().into_iter().collect()
    });
    record.asks = Some(if opts.full_orderbook {
        asks
    } else {
        best_ask.clone().into_iter().collect()
    });
    record.best_bid = best_bid;
    record.best_ask = best_ask;
    record.mid = mid;
    record.spread = spread;
    if opts.include_raw {
        record.raw = Some(raw.payload.clone());
    }
    Ok(record)
}
