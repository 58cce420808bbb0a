//! Indexer service: HTTP ingest, reorg handling, integrity, tip follower

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use secondlayer_core::{Config, Error, Result};
use secondlayer_storage::Store;

pub mod codec;
pub mod http;
pub mod ingest;
pub mod integrity;
pub mod node_client;
pub mod parse;
pub mod tip_follower;

pub use ingest::{BlockSource, IngestOutcome, IngestService};
pub use integrity::{backfill_range, IntegrityService};
pub use node_client::NodeClient;
pub use tip_follower::{TipFollower, TipFollowerState};

/// Run the indexer service until the shutdown signal flips
pub async fn run(config: Config, store: Store, shutdown: watch::Receiver<bool>) -> Result<()> {
    let node = Arc::new(NodeClient::new(&config)?);
    let ingest = Arc::new(IngestService::new(
        store.clone(),
        node.clone(),
        config.network.clone(),
    ));
    let integrity = Arc::new(IntegrityService::new(
        store.clone(),
        ingest.clone(),
        node.clone(),
        config.clone(),
    ));
    let tip_state = Arc::new(TipFollowerState::new());

    // Startup integrity pass; optionally refuse to start over gaps.
    let report = integrity.check().await?;
    if !report.gaps.is_empty() {
        if config.require_integrity {
            return Err(Error::validation(format!(
                "startup integrity check found {} gaps ({} blocks missing) and REQUIRE_INTEGRITY is set",
                report.gaps.len(),
                report.total_missing
            )));
        }
        info!(
            gap_count = report.gaps.len(),
            total_missing = report.total_missing,
            "Starting with gaps; integrity loop will repair"
        );
    }

    let integrity_task = tokio::spawn(integrity.clone().run(shutdown.clone()));

    let follower = TipFollower::new(
        store.clone(),
        ingest.clone(),
        node.clone(),
        tip_state.clone(),
        config.clone(),
    );
    let follower_task = tokio::spawn(follower.run(shutdown.clone()));

    let state = http::AppState {
        ingest,
        integrity,
        tip: tip_state,
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    http::serve(addr, state, shutdown).await?;

    for (name, task) in [("integrity", integrity_task), ("tip follower", follower_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Auxiliary task panicked");
        }
    }
    info!("Indexer stopped");
    Ok(())
}
