//! Configuration for the discovery and polling processes.
//!
//! Supports loading from a TOML file (`HARVEST_CONFIG`) with compiled-in
//! defaults for everything except `OUTPUT_DIR`, which must come from the
//! environment and must be an absolute path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use harvest_market::rules::{LimitlessRules, PolymarketRule, PolymarketRules};

/// Which venue integration a `[[venues]]` table configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Limitless,
    Polymarket,
}

/// Per-venue runtime parameters: worker pool size, AIMD knobs, and the
/// venue-specific discovery rules.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub name: String,
    pub kind: VenueKind,
    pub base_url: Option<String>,
    pub clob_url: Option<String>,
    pub api_key: Option<String>,
    /// Static worker pool size; the hard upper bound on concurrent fetches.
    pub max_workers: usize,
    /// AIMD ceiling for the adaptive inflight limit.
    pub inflight_ceiling: usize,
    pub request_timeout: Duration,
    pub cooldown_on_429: Duration,
    pub high_fail_rate: f64,
    pub high_latency: Duration,
    pub low_latency: Duration,
    pub stable_for: Duration,
    pub min_adjust_interval: Duration,
    pub full_orderbook: bool,
    pub include_raw: bool,
    pub limitless_rules: LimitlessRules,
    pub polymarket_rules: PolymarketRules,
}

/// Poller process parameters shared by all venues.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub tick_interval: Duration,
    pub snapshot_read_interval: Duration,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
    pub error_sample_per_sec: u32,
}

/// Discovery process parameters shared by all venues.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    /// Instruments are kept for this long past `expiration_ms` so books
    /// around resolution are still captured.
    pub expire_grace: Duration,
}

/// Rotating writer durability parameters.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub fsync_interval: Duration,
    pub fsync_records: usize,
}

/// Per-instrument backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_frac: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter_frac: 0.25,
        }
    }
}

/// Top-level configuration for both processes.
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub poller: PollerConfig,
    pub discovery: DiscoveryConfig,
    pub writer: WriterConfig,
    pub backoff: BackoffConfig,
    pub venues: Vec<VenueConfig>,
}

impl Config {
    /// Load configuration: `OUTPUT_DIR` from the environment (required,
    /// absolute), everything else from the optional `HARVEST_CONFIG` TOML
    /// file or compiled-in defaults.
    pub fn load() -> Result<Self> {
        let output_dir = std::env::var("OUTPUT_DIR")
            .context("OUTPUT_DIR environment variable is required")?;
        let output_dir = PathBuf::from(output_dir);
        if !output_dir.is_absolute() {
            bail!("OUTPUT_DIR must be an absolute path: {:?}", output_dir);
        }

        let toml_cfg = match std::env::var("HARVEST_CONFIG") {
            Ok(path) => Self::read_toml(Path::new(&path))?,
            Err(_) => TomlConfig::default(),
        };
        Ok(Self::from_parts(output_dir, toml_cfg))
    }

    /// Parse a TOML config file.
    pub fn read_toml(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;
        toml::from_str(&content).context("failed to parse TOML config")
    }

    pub fn from_parts(output_dir: PathBuf, toml: TomlConfig) -> Self {
        let venues = if toml.venues.is_empty() {
            vec![VenueToml::default_limitless(), VenueToml::default_polymarket()]
        } else {
            toml.venues
        };

        Self {
            output_dir,
            poller: PollerConfig {
                tick_interval: Duration::from_millis(toml.poller.tick_interval_ms),
                snapshot_read_interval: Duration::from_millis(
                    toml.poller.snapshot_read_interval_ms,
                ),
                stats_interval: Duration::from_secs(toml.poller.stats_interval_secs),
                shutdown_grace: Duration::from_secs(toml.poller.shutdown_grace_secs),
                error_sample_per_sec: toml.poller.error_sample_per_sec,
            },
            discovery: DiscoveryConfig {
                interval: Duration::from_secs(toml.discovery.interval_secs),
                expire_grace: Duration::from_secs(toml.discovery.expire_grace_secs),
            },
            writer: WriterConfig {
                fsync_interval: Duration::from_secs(toml.writer.fsync_interval_secs),
                fsync_records: toml.writer.fsync_records,
            },
            backoff: BackoffConfig {
                base: Duration::from_millis(toml.backoff.base_ms),
                cap: Duration::from_millis(toml.backoff.cap_ms),
                jitter_frac: toml.backoff.jitter_frac,
            },
            venues: venues.into_iter().map(VenueConfig::from).collect(),
        }
    }

    pub fn venue(&self, name: &str) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| v.name == name)
    }
}

/// TOML file structure for deserialization.
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    poller: PollerToml,
    #[serde(default)]
    discovery: DiscoveryToml,
    #[serde(default)]
    writer: WriterToml,
    #[serde(default)]
    backoff: BackoffToml,
    #[serde(default)]
    venues: Vec<VenueToml>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PollerToml {
    tick_interval_ms: u64,
    snapshot_read_interval_ms: u64,
    stats_interval_secs: u64,
    shutdown_grace_secs: u64,
    error_sample_per_sec: u32,
}

impl Default for PollerToml {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            snapshot_read_interval_ms: 1_000,
            stats_interval_secs: 10,
            shutdown_grace_secs: 5,
            error_sample_per_sec: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DiscoveryToml {
    interval_secs: u64,
    expire_grace_secs: u64,
}

impl Default for DiscoveryToml {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            expire_grace_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WriterToml {
    fsync_interval_secs: u64,
    fsync_records: usize,
}

impl Default for WriterToml {
    fn default() -> Self {
        Self {
            fsync_interval_secs: 1,
            fsync_records: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BackoffToml {
    base_ms: u64,
    cap_ms: u64,
    jitter_frac: f64,
}

impl Default for BackoffToml {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 300_000,
            jitter_frac: 0.25,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct VenueToml {
    name: String,
    kind: Option<VenueKind>,
    base_url: Option<String>,
    clob_url: Option<String>,
    api_key: Option<String>,
    max_workers: usize,
    inflight_ceiling: usize,
    request_timeout_secs: u64,
    cooldown_on_429_secs: u64,
    high_fail_rate: f64,
    high_latency_ms: u64,
    low_latency_ms: u64,
    stable_secs: u64,
    min_adjust_interval_secs: u64,
    full_orderbook: bool,
    include_raw: bool,
    underlyings: Vec<String>,
    max_markets_per_underlying: usize,
    rules: Vec<PolymarketRule>,
}

impl Default for VenueToml {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: None,
            base_url: None,
            clob_url: None,
            api_key: None,
            max_workers: 8,
            inflight_ceiling: 8,
            request_timeout_secs: 5,
            cooldown_on_429_secs: 30,
            high_fail_rate: 0.5,
            high_latency_ms: 2_000,
            low_latency_ms: 500,
            stable_secs: 60,
            min_adjust_interval_secs: 30,
            full_orderbook: true,
            include_raw: false,
            underlyings: vec![
                "BTC".to_string(),
                "ETH".to_string(),
                "SOL".to_string(),
                "XRP".to_string(),
            ],
            max_markets_per_underlying: 10,
            rules: Vec::new(),
        }
    }
}

impl VenueToml {
    fn default_limitless() -> Self {
        Self {
            name: "limitless".to_string(),
            kind: Some(VenueKind::Limitless),
            // Limitless tolerates more concurrency than the strict default.
            max_workers: 16,
            inflight_ceiling: 16,
            ..Self::default()
        }
    }

    fn default_polymarket() -> Self {
        Self {
            name: "polymarket".to_string(),
            kind: Some(VenueKind::Polymarket),
            inflight_ceiling: 4,
            rules: default_polymarket_rules(),
            ..Self::default()
        }
    }
}

/// Built-in rule set: intraday up-or-down series for the four tracked
/// underlyings, capped at 24h to expiry. The 5M/15M tags carry the
/// short-recurrence series hidden from the general listing; hourly and
/// daily markets come through the active fallback.
fn default_polymarket_rules() -> Vec<PolymarketRule> {
    ["btc", "eth", "sol", "xrp"]
        .iter()
        .map(|asset| PolymarketRule {
            name: format!("crypto_intraday_{asset}"),
            tag_slugs: vec!["5M".to_string(), "15M".to_string()],
            series_slug_prefixes: vec![format!("{asset}-up-or-down-")],
            min_minutes_to_expiry: 0.0,
            max_minutes_to_expiry: 1440.0,
            must_contain: Vec::new(),
            must_not_contain: Vec::new(),
        })
        .collect()
}

impl From<VenueToml> for VenueConfig {
    fn from(toml: VenueToml) -> Self {
        let kind = toml.kind.unwrap_or(VenueKind::Limitless);
        let rules = if toml.rules.is_empty() && kind == VenueKind::Polymarket {
            default_polymarket_rules()
        } else {
            toml.rules
        };
        Self {
            name: if toml.name.is_empty() {
                match kind {
                    VenueKind::Limitless => "limitless".to_string(),
                    VenueKind::Polymarket => "polymarket".to_string(),
                }
            } else {
                toml.name
            },
            kind,
            base_url: toml.base_url,
            clob_url: toml.clob_url,
            api_key: toml.api_key,
            max_workers: toml.max_workers.max(1),
            inflight_ceiling: toml.inflight_ceiling.clamp(1, toml.max_workers.max(1)),
            request_timeout: Duration::from_secs(toml.request_timeout_secs),
            cooldown_on_429: Duration::from_secs(toml.cooldown_on_429_secs),
            high_fail_rate: toml.high_fail_rate,
            high_latency: Duration::from_millis(toml.high_latency_ms),
            low_latency: Duration::from_millis(toml.low_latency_ms),
            stable_for: Duration::from_secs(toml.stable_secs),
            min_adjust_interval: Duration::from_secs(toml.min_adjust_interval_secs),
            full_orderbook: toml.full_orderbook,
            include_raw: toml.include_raw,
            limitless_rules: LimitlessRules {
                underlyings: toml.underlyings,
                max_markets_per_underlying: toml.max_markets_per_underlying,
            },
            polymarket_rules: PolymarketRules { rules },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_parts(PathBuf::from("/data"), TomlConfig::default());
        assert_eq!(cfg.poller.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.discovery.interval, Duration::from_secs(60));
        assert_eq!(cfg.writer.fsync_records, 256);
        assert_eq!(cfg.backoff.cap, Duration::from_secs(300));
        assert_eq!(cfg.venues.len(), 2);
        assert_eq!(cfg.venues[0].name, "limitless");
        assert_eq!(cfg.venues[1].name, "polymarket");
        assert_eq!(cfg.venues[1].inflight_ceiling, 4);
        assert!(!cfg.venues[1].polymarket_rules.rules.is_empty());
        let rule = &cfg.venues[1].polymarket_rules.rules[0];
        assert!(rule.tag_slugs.contains(&"15M".to_string()));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [poller]
            tick_interval_ms = 250
            stats_interval_secs = 5

            [discovery]
            interval_secs = 120
            expire_grace_secs = 90

            [[venues]]
            name = "limitless"
            kind = "limitless"
            max_workers = 4
            inflight_ceiling = 4
            underlyings = ["BTC"]

            [[venues]]
            name = "polymarket"
            kind = "polymarket"
            max_workers = 8
            inflight_ceiling = 4

            [[venues.rules]]
            name = "btc_only"
            series_slug_prefixes = ["btc-up-or-down-"]
            max_minutes_to_expiry = 120.0
        "#;
        let parsed: TomlConfig = toml::from_str(toml).unwrap();
        let cfg = Config::from_parts(PathBuf::from("/data"), parsed);
        assert_eq!(cfg.poller.tick_interval, Duration::from_millis(250));
        assert_eq!(cfg.discovery.expire_grace, Duration::from_secs(90));
        assert_eq!(cfg.venues[0].limitless_rules.underlyings, vec!["BTC"]);
        let pm = cfg.venue("polymarket").unwrap();
        assert_eq!(pm.polymarket_rules.rules.len(), 1);
        assert_eq!(pm.polymarket_rules.rules[0].name, "btc_only");
    }

    #[test]
    fn test_ceiling_clamped_to_workers() {
        let toml = r#"
            [[venues]]
            name = "limitless"
            kind = "limitless"
            max_workers = 4
            inflight_ceiling = 32
        "#;
        let parsed: TomlConfig = toml::from_str(toml).unwrap();
        let cfg = Config::from_parts(PathBuf::from("/data"), parsed);
        assert_eq!(cfg.venues[0].inflight_ceiling, 4);
    }
}
