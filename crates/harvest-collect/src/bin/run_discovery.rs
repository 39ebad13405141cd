//! Discovery process: periodically rediscovers instruments for every
//! configured venue, logs membership changes, and atomically publishes the
//! per-venue snapshot the poller consumes.
//!
//! Usage:
//!   OUTPUT_DIR=/abs/path run-discovery
//!
//! Environment:
//!   OUTPUT_DIR       required absolute output root
//!   HARVEST_CONFIG   optional TOML config path
//!   RUST_LOG         tracing filter (default: info)

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harvest_collect::config::Config;
use harvest_collect::discovery::VenueDiscovery;
use harvest_collect::runtime::build_runtimes;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load()?;
    let runtimes = build_runtimes(&config)?;
    info!(
        output_dir = %config.output_dir.display(),
        venues = runtimes.len(),
        "starting discovery process"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = JoinSet::new();
    for runtime in runtimes {
        let discovery = VenueDiscovery::new(
            runtime.discovery_client,
            config.discovery.clone(),
            config.writer.clone(),
            &config.output_dir,
        );
        tasks.spawn(discovery.run(shutdown_tx.subscribe()));
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
        // A venue loop only returns early when it hit a fatal error.
        Some(result) = tasks.join_next() => {
            error!("discovery task exited early");
            let _ = shutdown_tx.send(());
            result??;
        }
    }

    let mut failed = false;
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result.map_err(anyhow::Error::from).and_then(|r| r) {
            error!(%err, "discovery task failed");
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("one or more discovery loops failed");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
