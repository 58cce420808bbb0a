//! Integrity loop: gap detection, watermark recompute, auto-backfill
//!
//! Runs at startup and on a fixed cadence. The contiguous watermark is
//! recomputed from data each pass, which repairs anything a crash between
//! persist and progress-upsert left behind. Gaps that persist across a
//! cooldown window are backfilled from the upstream node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use secondlayer_core::{Config, Result};
use secondlayer_storage::blocks::{self, Gap};
use secondlayer_storage::Store;

use crate::ingest::{BlockSource, IngestService};
use crate::node_client::NodeClient;

/// Maximum gap intervals reported per scan
const MAX_GAPS_REPORTED: i64 = 50;

/// A gap must be observed continuously this long before backfill touches
/// it, so in-flight pushes get a chance to close it first.
const GAP_COOLDOWN: Duration = Duration::from_secs(300);

/// Snapshot returned by a single integrity pass
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub gaps: Vec<Gap>,
    pub total_missing: i64,
    pub last_contiguous: i64,
    pub last_indexed: i64,
}

impl IntegrityReport {
    pub fn status(&self) -> &'static str {
        if !self.gaps.is_empty() {
            "gaps_detected"
        } else if self.last_contiguous < self.last_indexed {
            "degraded"
        } else {
            "healthy"
        }
    }
}

/// Backfill progress surfaced on /health/integrity
#[derive(Debug, Default)]
pub struct BackfillProgress {
    pub remaining: AtomicI64,
    pub in_progress: AtomicBool,
}

pub struct IntegrityService {
    store: Store,
    ingest: Arc<IngestService>,
    node: Arc<NodeClient>,
    config: Config,
    backfill: Arc<BackfillProgress>,

    /// When each currently-open gap was first observed
    gap_first_seen: Mutex<HashMap<(i64, i64), Instant>>,
}

impl IntegrityService {
    pub fn new(
        store: Store,
        ingest: Arc<IngestService>,
        node: Arc<NodeClient>,
        config: Config,
    ) -> Self {
        Self {
            store,
            ingest,
            node,
            config,
            backfill: Arc::new(BackfillProgress::default()),
            gap_first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn backfill_progress(&self) -> Arc<BackfillProgress> {
        self.backfill.clone()
    }

    pub fn auto_backfill_enabled(&self) -> bool {
        self.config.auto_backfill
    }

    /// One integrity pass: scan gaps and recompute the contiguous watermark
    /// authoritatively from canonical data.
    pub async fn check(&self) -> Result<IntegrityReport> {
        let pool = self.store.pool();
        let gaps = blocks::find_gaps(pool, MAX_GAPS_REPORTED).await?;
        let total_missing = blocks::total_missing(pool).await?;

        let last_indexed = blocks::max_canonical_height(pool).await?.unwrap_or(0);

        let mut conn = pool.acquire().await?;
        let recomputed = match blocks::min_canonical_height(&mut *conn).await? {
            Some(min_height) => blocks::contiguous_tip_from(&mut conn, min_height)
                .await?
                .unwrap_or(0),
            None => 0,
        };
        blocks::set_contiguous(&mut *conn, &self.config.network, recomputed).await?;
        blocks::upsert_progress(&mut *conn, &self.config.network, last_indexed, recomputed, last_indexed)
            .await?;
        drop(conn);

        if !gaps.is_empty() {
            warn!(
                gap_count = gaps.len(),
                total_missing, "Integrity scan found gaps"
            );
        }

        Ok(IntegrityReport {
            gaps,
            total_missing,
            last_contiguous: recomputed,
            last_indexed,
        })
    }

    /// Run until shutdown: check at startup, then on the configured cadence,
    /// backfilling stable gaps when enabled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.integrity_interval_secs));
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

            let report = match self.check().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Integrity check failed");
                    continue;
                }
            };

            if self.config.auto_backfill && !report.gaps.is_empty() {
                let ready = self.gaps_past_cooldown(&report.gaps).await;
                if !ready.is_empty() {
                    if let Err(e) = self.backfill_gaps(&ready, &shutdown).await {
                        warn!(error = %e, "Auto-backfill failed");
                    }
                }
            }
        }
        info!("Integrity loop stopped");
    }

    /// Filter to gaps that have been open at least the cooldown, updating
    /// the first-seen bookkeeping and dropping closed gaps.
    async fn gaps_past_cooldown(&self, gaps: &[Gap]) -> Vec<Gap> {
        let now = Instant::now();
        let mut first_seen = self.gap_first_seen.lock().await;

        let current: std::collections::HashSet<(i64, i64)> =
            gaps.iter().map(|g| (g.gap_start, g.gap_end)).collect();
        first_seen.retain(|key, _| current.contains(key));

        let mut ready = Vec::new();
        for gap in gaps {
            let seen = first_seen
                .entry((gap.gap_start, gap.gap_end))
                .or_insert(now);
            if now.duration_since(*seen) >= GAP_COOLDOWN {
                ready.push(*gap);
            }
        }
        ready
    }

    /// Replay every missing block through ingest, rate limited
    async fn backfill_gaps(&self, gaps: &[Gap], shutdown: &watch::Receiver<bool>) -> Result<()> {
        let total: i64 = gaps.iter().map(|g| g.len()).sum();
        self.backfill.remaining.store(total, Ordering::Relaxed);
        self.backfill.in_progress.store(true, Ordering::Relaxed);

        let delay = Duration::from_secs_f64(1.0 / self.config.auto_backfill_rate as f64);
        info!(total, "Auto-backfill starting");

        let result = async {
            for gap in gaps {
                for height in gap.gap_start..=gap.gap_end {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    let payload = self.node.block_by_height(height).await?;
                    self.ingest
                        .ingest_block(payload, BlockSource::SelfReplay)
                        .await?;
                    self.backfill.remaining.fetch_sub(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(())
        }
        .await;

        self.backfill.in_progress.store(false, Ordering::Relaxed);
        self.backfill.remaining.store(0, Ordering::Relaxed);
        info!("Auto-backfill pass finished");
        result
    }
}

/// Operator-driven batch backfill: replay a height range through ingest at
/// a bounded rate. Returns the number of blocks replayed.
pub async fn backfill_range(
    config: &Config,
    store: Store,
    from: i64,
    to: i64,
    rate: u32,
) -> Result<u64> {
    if from > to {
        return Err(secondlayer_core::Error::validation(format!(
            "invalid range {}..={}",
            from, to
        )));
    }

    let node = Arc::new(NodeClient::new(config)?);
    let ingest = IngestService::new(store, node.clone(), config.network.clone());
    let delay = Duration::from_secs_f64(1.0 / rate.max(1) as f64);

    let mut replayed = 0;
    for height in from..=to {
        let payload = node.block_by_height(height).await?;
        ingest
            .ingest_block(payload, BlockSource::SelfReplay)
            .await?;
        replayed += 1;
        if height < to {
            tokio::time::sleep(delay).await;
        }
    }
    info!(from, to, replayed, "Batch backfill finished");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(gaps: Vec<Gap>, contiguous: i64, indexed: i64) -> IntegrityReport {
        let total_missing = gaps.iter().map(|g| g.len()).sum();
        IntegrityReport {
            gaps,
            total_missing,
            last_contiguous: contiguous,
            last_indexed: indexed,
        }
    }

    #[test]
    fn status_reflects_gaps_then_lag() {
        let healthy = report(vec![], 100, 100);
        assert_eq!(healthy.status(), "healthy");

        let degraded = report(vec![], 90, 100);
        assert_eq!(degraded.status(), "degraded");

        let gapped = report(
            vec![Gap {
                gap_start: 95,
                gap_end: 96,
            }],
            94,
            100,
        );
        assert_eq!(gapped.status(), "gaps_detected");
        assert_eq!(gapped.total_missing, 2);
    }
}
