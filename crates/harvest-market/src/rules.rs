//! Discovery filter rules, deserialized from the per-venue config tables.
//!
//! Rules are opaque to the data plane; only the owning venue client
//! interprets them.

use serde::Deserialize;

/// Limitless discovery rules: which underlyings to track and how many
/// markets per underlying to keep.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitlessRules {
    pub underlyings: Vec<String>,
    #[serde(default = "default_max_markets")]
    pub max_markets_per_underlying: usize,
}

fn default_max_markets() -> usize {
    10
}

impl Default for LimitlessRules {
    fn default() -> Self {
        Self {
            underlyings: ["BTC", "ETH", "SOL", "XRP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_markets_per_underlying: default_max_markets(),
        }
    }
}

/// One Polymarket discovery rule. A market matches when its slug starts with
/// one of the prefixes, its minutes-to-expiry falls inside the window, and
/// the title terms pass.
#[derive(Debug, Clone, Deserialize)]
pub struct PolymarketRule {
    pub name: String,
    /// Gamma tag slugs for the primary event fetch. Short-recurrence series
    /// live under dedicated tags and are hidden from the general listing.
    #[serde(default)]
    pub tag_slugs: Vec<String>,
    #[serde(default)]
    pub series_slug_prefixes: Vec<String>,
    #[serde(default)]
    pub min_minutes_to_expiry: f64,
    #[serde(default = "default_max_minutes")]
    pub max_minutes_to_expiry: f64,
    #[serde(default)]
    pub must_contain: Vec<String>,
    #[serde(default)]
    pub must_not_contain: Vec<String>,
}

fn default_max_minutes() -> f64 {
    1440.0
}

/// The full Polymarket rule set for one deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolymarketRules {
    #[serde(default)]
    pub rules: Vec<PolymarketRule>,
}

impl PolymarketRule {
    /// Check the title terms; empty lists always pass.
    pub fn title_matches(&self, title: &str) -> bool {
        let lower = title.to_lowercase();
        if !self.must_contain.is_empty()
            && !self.must_contain.iter().any(|k| lower.contains(&k.to_lowercase()))
        {
            return false;
        }
        if self.must_not_contain.iter().any(|k| lower.contains(&k.to_lowercase())) {
            return false;
        }
        true
    }

    pub fn slug_matches(&self, slug: &str) -> bool {
        self.series_slug_prefixes.is_empty()
            || self.series_slug_prefixes.iter().any(|p| slug.starts_with(p.as_str()))
    }

    pub fn expiry_matches(&self, minutes_to_expiry: f64) -> bool {
        minutes_to_expiry >= self.min_minutes_to_expiry
            && minutes_to_expiry <= self.max_minutes_to_expiry
    }
}
