//! resilient-sync - Periodic upstream synchronization with rate limiting,
//! circuit breaking and backoff
//!
//! This is the main entry point for the resilient-sync application.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info};

use resilient_sync::config::Config;
use resilient_sync::otel::{init_tracing, OtelProvider, SyncMetrics};
use resilient_sync::registry::install_scheduler;
use resilient_sync::sync::{FanoutSink, HttpSourceHandler, SyncScheduler, TracingSink};

/// resilient-sync - Periodic upstream synchronization
#[derive(Parser, Debug)]
#[command(name = "resilient-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RESILIENT_SYNC_CONFIG")]
    config: Option<String>,

    /// Sync every source once, print the results as JSON lines and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let otel_provider = OtelProvider::new(&config.otel)?;
    init_tracing(&otel_provider, &config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sources = config.sources.len(),
        "Starting resilient-sync"
    );

    let handler = HttpSourceHandler::new(&config.http, &config.sources)?;
    let metrics = SyncMetrics::new(&otel_provider.meter());
    let sink = FanoutSink::default()
        .with(Arc::new(TracingSink))
        .with(Arc::new(metrics));

    let scheduler = SyncScheduler::from_config(&config, Arc::new(handler), Some(Arc::new(sink)))?;

    if args.once {
        run_once(&scheduler).await?;
    } else {
        install_scheduler(scheduler.clone());
        scheduler.start_all();
        info!("All sources scheduled");

        shutdown_signal().await;
        scheduler.stop_all();

        let states = scheduler.get_all_states();
        info!(states = %serde_json::to_string(&states)?, "Final source states");
    }

    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("resilient-sync shutdown complete");
    Ok(())
}

/// Sync every source concurrently and print each result
async fn run_once(scheduler: &SyncScheduler) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();
    for source in scheduler.source_names() {
        let scheduler = scheduler.clone();
        let source = source.to_string();
        tasks.spawn(async move { scheduler.execute_sync(&source).await });
    }

    while let Some(joined) = tasks.join_next().await {
        let result = joined?;
        println!("{}", serde_json::to_string(&result)?);
    }

    scheduler.stop_all();
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
