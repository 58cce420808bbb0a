//! Block ingest: reorg detection, persistence, watermark advance, job fan-out

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use secondlayer_core::notify::{ViewReorgPayload, VIEW_REORG_CHANNEL};
use secondlayer_core::{Error, Result};
use secondlayer_storage::{blocks, queue::JobQueue, streams, Store};

use crate::node_client::NodeClient;
use crate::parse::{self, NewBlockPayload};

/// Where a payload came from. Self-sourced replays (tip follower, backfill)
/// do not reset the tip-follower clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Push,
    SelfReplay,
}

/// Result of an ingest call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ok {
        block_height: i64,
        transactions: usize,
        events: usize,
        jobs_enqueued: u64,
    },
    Duplicate,
}

/// Process-local ingest observability. Never authoritative.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub blocks_received_out_of_order: AtomicU64,
    pub last_seen_height: AtomicI64,
    pub blocks_fetched_via_poll: AtomicU64,
}

/// Shared ingest service used by the HTTP handler, tip follower, and
/// backfill. Safe to call concurrently; same-height calls serialize at the
/// store through the canonical-height uniqueness.
pub struct IngestService {
    store: Store,
    queue: JobQueue,
    node: Arc<NodeClient>,
    network: String,
    metrics: Arc<IngestMetrics>,
}

impl IngestService {
    pub fn new(store: Store, node: Arc<NodeClient>, network: String) -> Self {
        let queue = JobQueue::new(store.clone());
        Self {
            store,
            queue,
            node,
            network,
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Ingest one block payload. Idempotent by (height, hash).
    pub async fn ingest_block(
        &self,
        payload: NewBlockPayload,
        source: BlockSource,
    ) -> Result<IngestOutcome> {
        payload.validate().map_err(Error::validation)?;
        let height = payload.height;

        // Transactions resolve outside the store transaction: the raw decode
        // is pure and the lookup fallback must not hold a connection open.
        let transactions = parse::transactions_from_payload(&payload, &self.node).await;
        let events = parse::events_from_payload(&payload);
        let block = parse::block_from_payload(&payload);

        let mut tx = self.store.pool().begin().await?;

        // Reorg detection: a different canonical hash at this height.
        if let Some(current) = blocks::canonical_block_at(&mut *tx, height).await? {
            if current.hash == payload.hash {
                return Ok(IngestOutcome::Duplicate);
            }

            warn!(
                height,
                old_hash = %current.hash,
                new_hash = %payload.hash,
                "Reorg detected"
            );
            blocks::mark_non_canonical(&mut *tx, height, &current.hash).await?;

            let failed = JobQueue::fail_jobs_at_height(
                &mut *tx,
                height,
                &format!("reorg: block {} replaced by {}", current.hash, payload.hash),
            )
            .await?;
            if failed > 0 {
                info!(height, failed, "Failed jobs for reorged block");
            }

            // NOTIFY inside the transaction: delivered only on commit, so a
            // rewind is never announced for a block that was not replaced.
            let reorg = ViewReorgPayload {
                block_height: height,
                old_hash: current.hash,
                new_hash: payload.hash.clone(),
            };
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(VIEW_REORG_CHANNEL)
                .bind(serde_json::to_string(&reorg)?)
                .execute(&mut *tx)
                .await?;
        }

        // Out-of-order gauge: observability only.
        let last_seen = self.metrics.last_seen_height.load(Ordering::Relaxed);
        if height < last_seen {
            self.metrics
                .blocks_received_out_of_order
                .fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.last_seen_height.store(height, Ordering::Relaxed);

        // Parent continuity: warn only, the integrity loop repairs gaps.
        if height > 1 {
            match blocks::canonical_block_at(&mut *tx, height - 1).await? {
                Some(parent) if parent.hash != payload.parent_hash => {
                    warn!(
                        height,
                        expected = %payload.parent_hash,
                        stored = %parent.hash,
                        "Parent hash mismatch"
                    );
                }
                None => {
                    warn!(height, "Parent block not yet indexed");
                }
                _ => {}
            }
        }

        // A concurrent ingest of a different block at this height serializes
        // on the canonical-height uniqueness; the later loser sees duplicate.
        match blocks::upsert_block(&mut *tx, &block).await {
            Ok(_) => {}
            Err(Error::Duplicate(_)) => return Ok(IngestOutcome::Duplicate),
            Err(e) => return Err(e),
        }
        blocks::insert_transactions(&mut tx, &transactions).await?;
        blocks::insert_events(&mut tx, &events).await?;

        // Watermark advance.
        let contiguous = blocks::last_contiguous(&mut *tx, &self.network).await?;
        let new_contiguous = if height == contiguous + 1 {
            blocks::contiguous_tip_from(&mut tx, contiguous + 1)
                .await?
                .unwrap_or(contiguous)
        } else if contiguous == 0 && height > 1 {
            match blocks::min_canonical_height(&mut *tx).await? {
                Some(min_height) => blocks::contiguous_tip_from(&mut tx, min_height)
                    .await?
                    .unwrap_or(0),
                None => 0,
            }
        } else {
            contiguous
        };
        blocks::upsert_progress(&mut *tx, &self.network, height, new_contiguous, height).await?;

        tx.commit().await?;

        // Job fan-out happens after the block transaction commits, so a
        // worker can never claim a job whose block is absent.
        let jobs_enqueued = self
            .enqueue_jobs(height, source == BlockSource::SelfReplay)
            .await?;

        info!(
            height,
            transactions = transactions.len(),
            events = events.len(),
            jobs_enqueued,
            contiguous = new_contiguous,
            "Block ingested"
        );

        Ok(IngestOutcome::Ok {
            block_height: height,
            transactions: transactions.len(),
            events: events.len(),
            jobs_enqueued,
        })
    }

    async fn enqueue_jobs(&self, height: i64, backfill: bool) -> Result<u64> {
        let stream_ids: Vec<uuid::Uuid> = streams::active_streams(self.store.pool())
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if stream_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.pool().begin().await?;
        let enqueued = self
            .queue
            .enqueue_batch(&mut tx, &stream_ids, height, backfill)
            .await?;
        tx.commit().await?;

        if enqueued > 0 {
            self.queue.notify_new_job().await?;
        }
        Ok(enqueued)
    }
}
