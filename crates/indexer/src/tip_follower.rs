//! Tip follower: polls the upstream node when push delivery stalls
//!
//! `normal` → `polling` after a configurable silence; back to `normal` the
//! moment a real push arrives. The mode flag is checked inside the fetch
//! loop so a revert interrupts an in-flight poll promptly.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use secondlayer_core::{Config, Result};
use secondlayer_storage::{blocks, Store};

use crate::ingest::{BlockSource, IngestService};
use crate::node_client::NodeClient;

/// Shared tip-follower state, read by the health endpoint
#[derive(Debug)]
pub struct TipFollowerState {
    /// Unix seconds of the last externally pushed block
    last_block_received_at: AtomicI64,

    /// True while in polling mode
    polling: AtomicBool,

    /// Coalesces concurrent ticks
    running: AtomicBool,
}

impl TipFollowerState {
    pub fn new() -> Self {
        Self {
            last_block_received_at: AtomicI64::new(Utc::now().timestamp()),
            polling: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Record an external push; reverts polling mode immediately
    pub fn record_push(&self) {
        self.last_block_received_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        if self.polling.swap(false, Ordering::Relaxed) {
            info!("Push delivery resumed, tip follower back to normal");
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.polling.load(Ordering::Relaxed) {
            "polling"
        } else {
            "normal"
        }
    }

    pub fn seconds_since_last_block(&self) -> i64 {
        (Utc::now().timestamp() - self.last_block_received_at.load(Ordering::Relaxed)).max(0)
    }
}

impl Default for TipFollowerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that watches for push silence
pub struct TipFollower {
    store: Store,
    ingest: Arc<IngestService>,
    node: Arc<NodeClient>,
    state: Arc<TipFollowerState>,
    config: Config,
}

impl TipFollower {
    pub fn new(
        store: Store,
        ingest: Arc<IngestService>,
        node: Arc<NodeClient>,
        state: Arc<TipFollowerState>,
        config: Config,
    ) -> Self {
        Self {
            store,
            ingest,
            node,
            state,
            config,
        }
    }

    /// Run until shutdown. Each tick is coalesced: if the previous poll is
    /// still in flight the tick is skipped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.tip_follower_enabled {
            info!("Tip follower disabled");
            return;
        }

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tip_follower_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if self.state.running.swap(true, Ordering::Acquire) {
                continue;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Tip follower tick failed");
            }
            self.state.running.store(false, Ordering::Release);
        }
        info!("Tip follower stopped");
    }

    async fn tick(&self) -> Result<()> {
        let silence = self.state.seconds_since_last_block();
        if silence < self.config.tip_follower_timeout_secs as i64 {
            return Ok(());
        }

        if !self.state.polling.swap(true, Ordering::Relaxed) {
            warn!(
                silence_secs = silence,
                "No blocks pushed recently, switching to polling"
            );
        }
        self.poll_once().await
    }

    /// Fetch every block between our highest seen and the node tip
    async fn poll_once(&self) -> Result<()> {
        let tip = self.node.tip_height().await?;
        let highest_seen = blocks::get_progress(self.store.pool(), &self.config.network)
            .await?
            .map(|p| p.highest_seen_block)
            .unwrap_or(0);

        if tip <= highest_seen {
            debug!(tip, highest_seen, "Node tip not ahead, nothing to poll");
            return Ok(());
        }

        info!(from = highest_seen + 1, to = tip, "Polling blocks from node");
        let metrics = self.ingest.metrics();
        for height in (highest_seen + 1)..=tip {
            // A real push reverts the mode; stop polling mid-range.
            if !self.state.polling.load(Ordering::Relaxed) {
                break;
            }
            let payload = self.node.block_by_height(height).await?;
            self.ingest
                .ingest_block(payload, BlockSource::SelfReplay)
                .await?;
            metrics
                .blocks_fetched_via_poll
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reverts_polling_mode() {
        let state = TipFollowerState::new();
        assert_eq!(state.mode(), "normal");

        state.polling.store(true, Ordering::Relaxed);
        assert_eq!(state.mode(), "polling");

        state.record_push();
        assert_eq!(state.mode(), "normal");
        assert!(state.seconds_since_last_block() <= 1);
    }

    #[test]
    fn running_flag_coalesces() {
        let state = TipFollowerState::new();
        assert!(!state.running.swap(true, Ordering::Acquire));
        assert!(state.running.swap(true, Ordering::Acquire));
        state.running.store(false, Ordering::Release);
        assert!(!state.running.swap(true, Ordering::Acquire));
    }
}
