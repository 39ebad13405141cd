//! Polymarket venue integration.
//!
//! Polymarket is a dual-book venue: every market carries a YES and a NO
//! CLOB token with separate order books. Discovery walks the Gamma API and
//! emits two instruments per matching market; books are fetched from the
//! CLOB REST endpoint by token id.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use harvest_common::{Instrument, OrderbookRecord, Outcome};

use crate::rules::{PolymarketRule, PolymarketRules};
use crate::venue::{
    book_summary, parse_levels, DiscoveryError, FetchError, NormalizeError, NormalizeOptions,
    RawBook, VenueClient,
};

pub const VENUE: &str = "polymarket";

const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";

/// Page size for Gamma event listings.
const EVENTS_PAGE_LIMIT: usize = 100;

/// Connection settings for the Polymarket client.
#[derive(Debug, Clone)]
pub struct PolymarketSettings {
    pub gamma_url: String,
    pub clob_url: String,
    pub request_timeout: Duration,
    pub rules: PolymarketRules,
}

impl Default for PolymarketSettings {
    fn default() -> Self {
        Self {
            gamma_url: DEFAULT_GAMMA_URL.to_string(),
            clob_url: DEFAULT_CLOB_URL.to_string(),
            request_timeout: Duration::from_secs(5),
            rules: PolymarketRules::default(),
        }
    }
}

/// Market data from a Gamma API event listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    id: Option<String>,
    question: Option<String>,
    condition_id: Option<String>,
    slug: Option<String>,
    /// Token IDs as JSON string array: `["123", "456"]`
    clob_token_ids: Option<String>,
    /// Outcomes as JSON string array: `["Yes", "No"]`
    outcomes: Option<String>,
    end_date: Option<String>,
    active: Option<bool>,
    closed: Option<bool>,
}

/// Event data from the Gamma API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaEvent {
    id: Option<String>,
    title: Option<String>,
    markets: Option<Vec<GammaMarket>>,
}

/// YES/NO token ids parsed out of a market's `clobTokenIds` field.
#[derive(Debug, Clone)]
struct TokenIds {
    yes_token_id: String,
    no_token_id: String,
}

/// Polymarket Gamma + CLOB REST client. One instance per worker.
pub struct PolymarketClient {
    http: reqwest::Client,
    settings: PolymarketSettings,
}

impl PolymarketClient {
    pub fn new(settings: PolymarketSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { http, settings })
    }

    /// Fetch candidate events: one page per configured tag slug (these
    /// series are hidden from the general listing), then an `active=true`
    /// fallback page for series without a dedicated tag.
    async fn fetch_active_events(&self) -> Result<Vec<GammaEvent>, DiscoveryError> {
        let mut events = Vec::new();

        let mut tags: Vec<&str> = self
            .settings
            .rules
            .rules
            .iter()
            .flat_map(|rule| rule.tag_slugs.iter().map(String::as_str))
            .collect();
        tags.sort_unstable();
        tags.dedup();

        for tag in tags {
            let url = format!(
                "{}/events?tag_slug={}&closed=false&limit={}",
                self.settings.gamma_url, tag, EVENTS_PAGE_LIMIT
            );
            let response = self.http.get(&url).send().await?;
            if response.status().is_success() {
                let page: Vec<GammaEvent> = response.json().await?;
                debug!(tag, count = page.len(), "gamma events fetched for tag");
                events.extend(page);
            }
        }

        let url = format!(
            "{}/events?active=true&closed=false&limit={}",
            self.settings.gamma_url, EVENTS_PAGE_LIMIT
        );
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                if let Ok(page) = response.json::<Vec<GammaEvent>>().await {
                    debug!(count = page.len(), "gamma events fetched from active listing");
                    events.extend(page);
                }
            }
            // Nothing from the tag fetches either: fail the cycle rather
            // than publish an empty set over a transient listing outage.
            _ if events.is_empty() => {
                return Err(DiscoveryError::InvalidData(
                    "gamma event listing unavailable".to_string(),
                ));
            }
            _ => {}
        }

        // The same event can appear under several tags and in the fallback.
        let mut seen = HashSet::new();
        events.retain(|event| match &event.id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        });
        Ok(events)
    }

    /// Parse token IDs from the market's `clobTokenIds` field. The API
    /// returns this as a JSON string: `"[\"123\", \"456\"]"`.
    fn parse_token_ids(market: &GammaMarket) -> Option<TokenIds> {
        let tokens_str = market.clob_token_ids.as_ref()?;
        let tokens: Vec<String> = match serde_json::from_str(tokens_str) {
            Ok(t) => t,
            Err(e) => {
                debug!("failed to parse clobTokenIds '{}': {}", tokens_str, e);
                return None;
            }
        };
        if tokens.len() != 2 {
            debug!("expected 2 token IDs, got {}: {:?}", tokens.len(), tokens);
            return None;
        }

        // Outcome order decides which token is YES; index 0 is YES by
        // convention when outcomes are absent or unparseable.
        let outcomes: Vec<String> = market
            .outcomes
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| vec!["Yes".to_string(), "No".to_string()]);
        let yes_idx = outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case("yes"))
            .unwrap_or(0);
        let no_idx = outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case("no"))
            .unwrap_or(1);

        Some(TokenIds {
            yes_token_id: tokens.get(yes_idx).cloned().unwrap_or_default(),
            no_token_id: tokens.get(no_idx).cloned().unwrap_or_default(),
        })
    }

    fn parse_end_ms(market: &GammaMarket) -> Option<i64> {
        let end = market.end_date.as_ref()?;
        DateTime::parse_from_rfc3339(end)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
    }

    /// Match one market against one rule, expanding to YES and NO
    /// instruments on success.
    fn instruments_for(
        market: &GammaMarket,
        rule: &PolymarketRule,
        now_ms: i64,
    ) -> Option<Vec<Instrument>> {
        if market.active == Some(false) || market.closed == Some(true) {
            return None;
        }
        let slug = market.slug.as_deref()?;
        if !rule.slug_matches(slug) {
            return None;
        }

        let end_ms = Self::parse_end_ms(market)?;
        let minutes_to_expiry = (end_ms - now_ms) as f64 / 60_000.0;
        if !rule.expiry_matches(minutes_to_expiry) {
            return None;
        }

        let title = market.question.as_deref().unwrap_or("");
        if !rule.title_matches(title) {
            return None;
        }

        let tokens = Self::parse_token_ids(market)?;
        let market_id = market.id.clone()?;

        let mut extra = BTreeMap::new();
        if let Some(condition_id) = &market.condition_id {
            extra.insert("condition_id".to_string(), serde_json::json!(condition_id));
        }

        let build = |token_id: String, outcome: Outcome| Instrument {
            venue: VENUE.to_string(),
            poll_key: token_id,
            market_id: market_id.clone(),
            expiration_ms: end_ms,
            slug: Some(slug.to_string()),
            title: market.question.clone(),
            outcome: Some(outcome),
            underlying: None,
            rule: Some(rule.name.clone()),
            extra: extra.clone(),
        };

        Some(vec![
            build(tokens.yes_token_id, Outcome::Yes),
            build(tokens.no_token_id, Outcome::No),
        ])
    }
}

#[async_trait]
impl VenueClient for PolymarketClient {
    fn venue(&self) -> &str {
        VENUE
    }

    async fn discover(&self) -> Result<Vec<Instrument>, DiscoveryError> {
        let events = self.fetch_active_events().await?;
        debug!(count = events.len(), "gamma events fetched");

        let now_ms = Utc::now().timestamp_millis();
        let mut instruments = Vec::new();
        for event in &events {
            let Some(markets) = &event.markets else {
                continue;
            };
            for market in markets {
                for rule in &self.settings.rules.rules {
                    if let Some(mut found) = Self::instruments_for(market, rule, now_ms) {
                        instruments.append(&mut found);
                        break;
                    }
                }
            }
        }
        if instruments.is_empty() && !events.is_empty() {
            warn!(
                events = events.len(),
                "gamma returned events but no market matched the configured rules"
            );
        }
        Ok(instruments)
    }

    async fn get_orderbook(&self, poll_key: &str) -> Result<RawBook, FetchError> {
        let url = format!("{}/book?token_id={}", self.settings.clob_url, poll_key);
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

        // The CLOB book carries its own "as of" timestamp as a ms string.
        let ob_ts_ms = payload
            .get("timestamp")
            .and_then(|v| match v {
                serde_json::Value::String(s) => s.parse::<i64>().ok(),
                serde_json::Value::Number(n) => n.as_i64(),
                _ => None,
            });

        Ok(RawBook { payload, ob_ts_ms })
    }
}

/// Normalize a raw CLOB book (`bids`/`asks` ladders of string price/size)
/// into the wire record.
pub fn normalize_orderbook(
    raw: &RawBook,
    instrument: &Instrument,
    ts_ms: i64,
    opts: &NormalizeOptions,
) -> Result<OrderbookRecord, NormalizeError> {
    let payload = raw
        .payload
        .as_object()
        .ok_or_else(|| NormalizeError("book payload is not an object".to_string()))?;

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
