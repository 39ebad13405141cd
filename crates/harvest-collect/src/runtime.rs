//! Venue wiring: resolve each configured venue into its client instances
//! and normalizer.

use std::sync::Arc;

use anyhow::{Context, Result};

use harvest_market::limitless::{LimitlessClient, LimitlessSettings};
use harvest_market::polymarket::{PolymarketClient, PolymarketSettings};
use harvest_market::{Normalizer, VenueClient};

use crate::config::{Config, VenueConfig, VenueKind};

/// Everything the two processes need for one venue: a discovery client, a
/// set of isolated polling clients (one per worker, each with its own
/// connection pool), and the venue's normalizer.
pub struct VenueRuntime {
    pub cfg: VenueConfig,
    pub discovery_client: Arc<dyn VenueClient>,
    pub poll_clients: Vec<Arc<dyn VenueClient>>,
    pub normalizer: Normalizer,
}

pub fn build_runtimes(config: &Config) -> Result<Vec<VenueRuntime>> {
    config.venues.iter().map(build_runtime).collect()
}

fn build_runtime(cfg: &VenueConfig) -> Result<VenueRuntime> {
    let discovery_client = build_client(cfg)
        .with_context(|| format!("building discovery client for venue {}", cfg.name))?;
    let poll_clients = (0..cfg.max_workers)
        .map(|_| build_client(cfg))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("building worker clients for venue {}", cfg.name))?;

    Ok(VenueRuntime {
        cfg: cfg.clone(),
        discovery_client,
        poll_clients,
        normalizer: normalizer_for(cfg.kind),
    })
}

fn build_client(cfg: &VenueConfig) -> Result<Arc<dyn VenueClient>> {
    match cfg.kind {
        VenueKind::Limitless => {
            let mut settings = LimitlessSettings::default();
            if let Some(url) = &cfg.base_url {
                settings.base_url = url.clone();
            }
            settings.api_key = cfg.api_key.clone();
            settings.request_timeout = cfg.request_timeout;
            settings.rules = cfg.limitless_rules.clone();
            Ok(Arc::new(LimitlessClient::new(settings)?))
        }
        VenueKind::Polymarket => {
            let mut settings = PolymarketSettings::default();
            if let Some(url) = &cfg.base_url {
                settings.gamma_url = url.clone();
            }
            if let Some(url) = &cfg.clob_url {
                settings.clob_url = url.clone();
            }
            settings.request_timeout = cfg.request_timeout;
            settings.rules = cfg.polymarket_rules.clone();
            Ok(Arc::new(PolymarketClient::new(settings)?))
        }
    }
}

fn normalizer_for(kind: VenueKind) -> Normalizer {
    match kind {
        VenueKind::Limitless => harvest_market::limitless::normalize_orderbook,
        VenueKind::Polymarket => harvest_market::polymarket::normalize_orderbook,
    }
}
