//! SecondLayer service entry point
//!
//! One binary, one subcommand per service. `all` runs the whole pipeline in
//! a single process for development; `migrate`, `status`, and `backfill`
//! are one-shot operator commands.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use secondlayer_core::Config;
use secondlayer_storage::{blocks, JobQueue, Store};

mod receiver;

/// Maximum time to wait for graceful shutdown before forcing exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "secondlayer")]
#[command(author, version, about = "Chain event streams pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the block indexer (HTTP ingest, integrity, tip follower)
    Indexer,

    /// Run the webhook delivery worker
    Worker,

    /// Run the view processor
    Views,

    /// Run every service in one process
    All,

    /// Apply the store schema and exit
    Migrate,

    /// Print watermarks and gap status
    Status,

    /// Replay a block range from the upstream node through ingest
    Backfill {
        /// First height to replay
        #[arg(long)]
        from: i64,

        /// Last height to replay (inclusive)
        #[arg(long)]
        to: i64,

        /// Blocks per second
        #[arg(long, default_value_t = 10)]
        rate: u32,
    },

    /// Run a development webhook receiver that verifies signatures
    Receiver {
        /// Listen port
        #[arg(long, default_value_t = 3900)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // The receiver is store-free; everything else needs the database.
    if let Commands::Receiver { port } = cli.command {
        let secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| anyhow::anyhow!("WEBHOOK_SECRET must be set for the receiver"))?;
        return receiver::run(port, secret).await;
    }

    let config = Config::from_env()?;
    let store = Store::connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            // Store::connect already bootstrapped the schema.
            info!("Schema is up to date");
            return Ok(());
        }
        Commands::Status => {
            print_status(&config, &store).await?;
            return Ok(());
        }
        Commands::Backfill { from, to, rate } => {
            let replayed =
                secondlayer_indexer::backfill_range(&config, store, from, to, rate).await?;
            println!("replayed {} blocks ({}..={})", replayed, from, to);
            return Ok(());
        }
        _ => {}
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services = JoinSet::new();

    if matches!(cli.command, Commands::Indexer | Commands::All) {
        let (config, store, shutdown) = (config.clone(), store.clone(), shutdown_rx.clone());
        services.spawn(async move {
            ("indexer", secondlayer_indexer::run(config, store, shutdown).await)
        });
    }
    if matches!(cli.command, Commands::Worker | Commands::All) {
        let (config, store, shutdown) = (config.clone(), store.clone(), shutdown_rx.clone());
        services.spawn(async move {
            ("worker", secondlayer_worker::run(config, store, shutdown).await)
        });
    }
    if matches!(cli.command, Commands::Views | Commands::All) {
        let (config, store, shutdown) = (config.clone(), store.clone(), shutdown_rx.clone());
        services.spawn(async move {
            ("views", secondlayer_views::run(config, store, shutdown).await)
        });
    }
    drop(shutdown_rx);

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutdown signal received, draining services");
        }
        joined = services.join_next() => {
            // A service exiting on its own takes the rest down with it.
            match joined {
                Some(Ok((name, Ok(())))) => warn!(service = name, "Service exited early"),
                Some(Ok((name, Err(e)))) => error!(service = name, error = %e, "Service failed"),
                Some(Err(e)) => error!(error = %e, "Service task panicked"),
                None => {}
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(joined) = services.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = name, "Service stopped cleanly"),
                Ok((name, Err(e))) => error!(service = name, error = %e, "Service failed"),
                Err(e) => error!(error = %e, "Service task panicked"),
            }
        }
    };

    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Shutdown grace period elapsed, forcing exit");
        std::process::exit(1);
    }

    info!("All services stopped");
    Ok(())
}

/// Print watermarks and gap summary for the configured network
async fn print_status(config: &Config, store: &Store) -> Result<()> {
    let progress = blocks::get_progress(store.pool(), &config.network).await?;
    match progress {
        Some(progress) => {
            println!("network:               {}", progress.network);
            println!("last_indexed_block:    {}", progress.last_indexed_block);
            println!("last_contiguous_block: {}", progress.last_contiguous_block);
            println!("highest_seen_block:    {}", progress.highest_seen_block);
            println!("updated_at:            {}", progress.updated_at);
        }
        None => println!("network: {} (no blocks indexed yet)", config.network),
    }

    let gaps = blocks::find_gaps(store.pool(), 50).await?;
    let missing = blocks::total_missing(store.pool()).await?;
    if gaps.is_empty() {
        println!("gaps:                  none");
    } else {
        println!("gaps:                  {} ({} blocks missing)", gaps.len(), missing);
        for gap in gaps {
            println!("  {}..={}", gap.gap_start, gap.gap_end);
        }
    }

    let stats = JobQueue::new(store.clone()).stats().await?;
    println!(
        "jobs:                  {} pending, {} processing, {} completed, {} failed",
        stats.pending, stats.processing, stats.completed, stats.failed
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
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
