//! Polling process: one scheduler per venue reads the discovery snapshot
//! and polls order books under adaptive rate-limit control, appending to
//! the rotating orderbook / poll_stats / poll_errors logs.
//!
//! Usage:
//!   OUTPUT_DIR=/abs/path run-logger
//!
//! Environment:
//!   OUTPUT_DIR       required absolute output root (shared with discovery)
//!   HARVEST_CONFIG   optional TOML config path
//!   RUST_LOG         tracing filter (default: info)

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harvest_collect::config::Config;
use harvest_collect::runtime::build_runtimes;
use harvest_collect::scheduler::VenueScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load()?;
    let runtimes = build_runtimes(&config)?;
    info!(
        output_dir = %config.output_dir.display(),
        venues = runtimes.len(),
        "starting polling process"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = JoinSet::new();
    for runtime in runtimes {
        let scheduler = VenueScheduler::new(
            runtime.cfg,
            config.poller.clone(),
            config.writer.clone(),
            config.backoff.clone(),
            runtime.poll_clients,
            runtime.normalizer,
            &config.output_dir,
        );
        tasks.spawn(scheduler.run(shutdown_tx.subscribe()));
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
        // A scheduler only returns early on a fatal write-path failure.
        Some(result) = tasks.join_next() => {
            error!("scheduler task exited early");
            let _ = shutdown_tx.send(());
            result??;
        }
    }

    let mut failed = false;
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result.map_err(anyhow::Error::from).and_then(|r| r) {
            error!(%err, "scheduler task failed");
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("one or more venue schedulers failed");
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
