//! Block, transaction, event, and watermark persistence
//!
//! The indexer owns all writes here. Single-statement operations accept any
//! `PgExecutor` so they compose into the ingest transaction; multi-statement
//! operations take the transaction connection directly.

use sqlx::postgres::PgQueryResult;
use sqlx::{PgConnection, PgExecutor, PgPool, QueryBuilder};

use secondlayer_core::types::{BlockRecord, EventRecord, IndexProgress, TransactionRecord};
use secondlayer_core::Result;

/// Parameter chunking keeps bulk inserts under the wire limit
const TX_CHUNK: usize = 500;
const EVENT_CHUNK: usize = 1000;

/// Block insert parameters
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub height: i64,
    pub hash: String,
    pub parent_hash: String,
    pub burn_block_height: i64,
    pub timestamp: i64,
}

/// Transaction insert parameters
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tx_id: String,
    pub block_height: i64,
    pub block_hash: String,
    pub tx_index: i32,
    pub tx_type: String,
    pub sender: String,
    pub status: String,
    pub contract_id: Option<String>,
    pub function_name: Option<String>,
    pub raw_tx: Option<String>,
}

/// Event insert parameters
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tx_id: String,
    pub block_height: i64,
    pub block_hash: String,
    pub event_index: i32,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// A run of missing canonical heights, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub gap_start: i64,
    pub gap_end: i64,
}

impl Gap {
    pub fn len(&self) -> i64 {
        self.gap_end - self.gap_start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.gap_end < self.gap_start
    }
}

/// The canonical block at a height, if any
pub async fn canonical_block_at<'e, E>(executor: E, height: i64) -> Result<Option<BlockRecord>>
where
    E: PgExecutor<'e>,
{
    let block = sqlx::query_as::<_, BlockRecord>(
        "SELECT height, hash, parent_hash, burn_block_height, timestamp, canonical, received_at
         FROM blocks WHERE height = $1 AND canonical",
    )
    .bind(height)
    .fetch_optional(executor)
    .await?;
    Ok(block)
}

/// Flip a specific block out of the canonical chain
pub async fn mark_non_canonical<'e, E>(executor: E, height: i64, hash: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE blocks SET canonical = FALSE WHERE height = $1 AND hash = $2")
        .bind(height)
        .bind(hash)
        .execute(executor)
        .await?;
    Ok(())
}

/// Insert or refresh a block row. Conflict on (height, hash) replaces the
/// mutable fields and restores canonical status.
pub async fn upsert_block<'e, E>(executor: E, block: &NewBlock) -> Result<PgQueryResult>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO blocks (height, hash, parent_hash, burn_block_height, timestamp, canonical)
        VALUES ($1, $2, $3, $4, $5, TRUE)
        ON CONFLICT (height, hash) DO UPDATE SET
            parent_hash = EXCLUDED.parent_hash,
            burn_block_height = EXCLUDED.burn_block_height,
            timestamp = EXCLUDED.timestamp,
            canonical = TRUE
        "#,
    )
    .bind(block.height)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(block.burn_block_height)
    .bind(block.timestamp)
    .execute(executor)
    .await?;
    Ok(result)
}

/// Bulk-insert transactions in chunks, deduplicated by primary key. A
/// conflicting row is re-pointed at its current block (a re-mined
/// transaction after a reorg); the guard keeps duplicate ingest a no-op.
pub async fn insert_transactions(conn: &mut PgConnection, txs: &[NewTransaction]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in txs.chunks(TX_CHUNK) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO transactions \
             (tx_id, block_height, block_hash, tx_index, tx_type, sender, status, contract_id, function_name, raw_tx) ",
        );
        qb.push_values(chunk, |mut b, tx| {
            b.push_bind(&tx.tx_id);
            b.push_bind(tx.block_height);
            b.push_bind(&tx.block_hash);
            b.push_bind(tx.tx_index);
            b.push_bind(&tx.tx_type);
            b.push_bind(&tx.sender);
            b.push_bind(&tx.status);
            b.push_bind(&tx.contract_id);
            b.push_bind(&tx.function_name);
            b.push_bind(&tx.raw_tx);
        });
        qb.push(
            " ON CONFLICT (tx_id) DO UPDATE SET \
              block_height = EXCLUDED.block_height, \
              block_hash = EXCLUDED.block_hash, \
              tx_index = EXCLUDED.tx_index, \
              status = EXCLUDED.status \
              WHERE transactions.block_hash IS DISTINCT FROM EXCLUDED.block_hash \
                 OR transactions.block_height IS DISTINCT FROM EXCLUDED.block_height",
        );
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Bulk-insert events in chunks, deduplicated by (tx_id, event_index),
/// with the same re-point-on-conflict behavior as transactions.
pub async fn insert_events(conn: &mut PgConnection, events: &[NewEvent]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in events.chunks(EVENT_CHUNK) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO events (tx_id, block_height, block_hash, event_index, event_type, payload) ",
        );
        qb.push_values(chunk, |mut b, ev| {
            b.push_bind(&ev.tx_id);
            b.push_bind(ev.block_height);
            b.push_bind(&ev.block_hash);
            b.push_bind(ev.event_index);
            b.push_bind(&ev.event_type);
            b.push_bind(&ev.payload);
        });
        qb.push(
            " ON CONFLICT (tx_id, event_index) DO UPDATE SET \
              block_height = EXCLUDED.block_height, \
              block_hash = EXCLUDED.block_hash, \
              event_type = EXCLUDED.event_type, \
              payload = EXCLUDED.payload \
              WHERE events.block_hash IS DISTINCT FROM EXCLUDED.block_hash \
                 OR events.block_height IS DISTINCT FROM EXCLUDED.block_height",
        );
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Lowest canonical height in the store
pub async fn min_canonical_height<'e, E>(executor: E) -> Result<Option<i64>>
where
    E: PgExecutor<'e>,
{
    let height: Option<i64> =
        sqlx::query_scalar("SELECT MIN(height) FROM blocks WHERE canonical")
            .fetch_one(executor)
            .await?;
    Ok(height)
}

/// Highest canonical height in the store
pub async fn max_canonical_height<'e, E>(executor: E) -> Result<Option<i64>>
where
    E: PgExecutor<'e>,
{
    let height: Option<i64> =
        sqlx::query_scalar("SELECT MAX(height) FROM blocks WHERE canonical")
            .fetch_one(executor)
            .await?;
    Ok(height)
}

/// Walk canonical blocks upward from `from` and return the last height of
/// the contiguous run, or None when `from` itself is not canonical.
pub async fn contiguous_tip_from(conn: &mut PgConnection, from: i64) -> Result<Option<i64>> {
    let anchored: Option<i64> =
        sqlx::query_scalar("SELECT height FROM blocks WHERE height = $1 AND canonical")
            .bind(from)
            .fetch_optional(&mut *conn)
            .await?;
    if anchored.is_none() {
        return Ok(None);
    }

    // First canonical height at or above `from` with no canonical successor.
    let tip: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT b.height FROM blocks b
        WHERE b.canonical AND b.height >= $1
          AND NOT EXISTS (
              SELECT 1 FROM blocks b2 WHERE b2.canonical AND b2.height = b.height + 1
          )
        ORDER BY b.height
        LIMIT 1
        "#,
    )
    .bind(from)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(tip)
}

/// Upsert watermarks with GREATEST semantics: values only ever move forward
pub async fn upsert_progress<'e, E>(
    executor: E,
    network: &str,
    last_indexed: i64,
    last_contiguous: i64,
    highest_seen: i64,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO index_progress
            (network, last_indexed_block, last_contiguous_block, highest_seen_block, updated_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (network) DO UPDATE SET
            last_indexed_block = GREATEST(index_progress.last_indexed_block, EXCLUDED.last_indexed_block),
            last_contiguous_block = GREATEST(index_progress.last_contiguous_block, EXCLUDED.last_contiguous_block),
            highest_seen_block = GREATEST(index_progress.highest_seen_block, EXCLUDED.highest_seen_block),
            updated_at = now()
        "#,
    )
    .bind(network)
    .bind(last_indexed)
    .bind(last_contiguous)
    .bind(highest_seen)
    .execute(executor)
    .await?;
    Ok(())
}

/// Authoritative write of the contiguous watermark. The integrity loop uses
/// this after recomputing from data; GREATEST semantics do not apply because
/// the recomputed value is the truth.
pub async fn set_contiguous<'e, E>(executor: E, network: &str, value: i64) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO index_progress (network, last_contiguous_block, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (network) DO UPDATE SET
            last_contiguous_block = EXCLUDED.last_contiguous_block,
            updated_at = now()
        "#,
    )
    .bind(network)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}

/// Current watermarks for a network
pub async fn get_progress<'e, E>(executor: E, network: &str) -> Result<Option<IndexProgress>>
where
    E: PgExecutor<'e>,
{
    let progress = sqlx::query_as::<_, IndexProgress>(
        "SELECT network, last_indexed_block, last_contiguous_block, highest_seen_block, updated_at
         FROM index_progress WHERE network = $1",
    )
    .bind(network)
    .fetch_optional(executor)
    .await?;
    Ok(progress)
}

/// The contiguous watermark, 0 when the network has no progress row yet
pub async fn last_contiguous<'e, E>(executor: E, network: &str) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let value: Option<i64> = sqlx::query_scalar(
        "SELECT last_contiguous_block FROM index_progress WHERE network = $1",
    )
    .bind(network)
    .fetch_optional(executor)
    .await?;
    Ok(value.unwrap_or(0))
}

/// Up to `limit` missing-height intervals between canonical blocks
pub async fn find_gaps<'e, E>(executor: E, limit: i64) -> Result<Vec<Gap>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT height + 1 AS gap_start, next_height - 1 AS gap_end
        FROM (
            SELECT height, LEAD(height) OVER (ORDER BY height) AS next_height
            FROM blocks WHERE canonical
        ) t
        WHERE next_height IS NOT NULL AND next_height - height > 1
        ORDER BY gap_start
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(gap_start, gap_end)| Gap { gap_start, gap_end })
        .collect())
}

/// Total count of missing canonical heights across all gaps
pub async fn total_missing<'e, E>(executor: E) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let missing: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(next_height - height - 1), 0)::BIGINT
        FROM (
            SELECT height, LEAD(height) OVER (ORDER BY height) AS next_height
            FROM blocks WHERE canonical
        ) t
        WHERE next_height IS NOT NULL AND next_height - height > 1
        "#,
    )
    .fetch_one(executor)
    .await?;
    Ok(missing)
}

/// Canonical block plus its transactions and events, loaded for delivery or
/// view processing. Rows are matched on the canonical block's hash, so
/// orphaned rows left behind by a reorg stay out of live reads. Returns
/// None when no canonical block exists at `height`.
pub async fn block_with_data(
    pool: &PgPool,
    height: i64,
) -> Result<Option<(BlockRecord, Vec<TransactionRecord>, Vec<EventRecord>)>> {
    let Some(block) = canonical_block_at(pool, height).await? else {
        return Ok(None);
    };

    let transactions = sqlx::query_as::<_, TransactionRecord>(
        "SELECT tx_id, block_height, block_hash, tx_index, tx_type, sender, status, contract_id, function_name, raw_tx
         FROM transactions WHERE block_height = $1 AND block_hash = $2 ORDER BY tx_index",
    )
    .bind(height)
    .bind(&block.hash)
    .fetch_all(pool)
    .await?;

    let events = sqlx::query_as::<_, EventRecord>(
        "SELECT id, tx_id, block_height, block_hash, event_index, event_type, payload
         FROM events WHERE block_height = $1 AND block_hash = $2 ORDER BY tx_id, event_index",
    )
    .bind(height)
    .bind(&block.hash)
    .fetch_all(pool)
    .await?;

    Ok(Some((block, transactions, events)))
}
