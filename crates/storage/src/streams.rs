//! Stream, metrics, and delivery persistence
//!
//! Streams are mutated by the API layer; the pipeline only reads them and
//! appends metrics and delivery audit rows.

use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use secondlayer_core::types::{DeliveryStatus, StreamMetrics, StreamRecord};
use secondlayer_core::Result;

const STREAM_COLUMNS: &str = "id, name, status, filters, options, webhook_url, webhook_secret, \
                              owner_id, created_at, updated_at";

/// Every stream currently accepting deliveries
pub async fn active_streams<'e, E>(executor: E) -> Result<Vec<StreamRecord>>
where
    E: PgExecutor<'e>,
{
    let streams = sqlx::query_as::<_, StreamRecord>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE status = 'active' ORDER BY created_at"
    ))
    .fetch_all(executor)
    .await?;
    Ok(streams)
}

/// A single stream by id
pub async fn get_stream<'e, E>(executor: E, id: Uuid) -> Result<Option<StreamRecord>>
where
    E: PgExecutor<'e>,
{
    let stream = sqlx::query_as::<_, StreamRecord>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(stream)
}

/// Parameters for one delivery audit row
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub stream_id: Uuid,
    pub job_id: Option<i64>,
    pub block_height: i64,
    pub status: DeliveryStatus,
    pub http_status: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub attempts: i32,
    pub error: Option<String>,
    pub payload: serde_json::Value,
}

/// Append an immutable delivery record
pub async fn insert_delivery(pool: &PgPool, delivery: &NewDelivery) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO deliveries
            (stream_id, job_id, block_height, status, http_status, response_time_ms, attempts, error, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(delivery.stream_id)
    .bind(delivery.job_id)
    .bind(delivery.block_height)
    .bind(delivery.status.as_str())
    .bind(delivery.http_status)
    .bind(delivery.response_time_ms)
    .bind(delivery.attempts)
    .bind(&delivery.error)
    .bind(&delivery.payload)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Bump the per-stream counters after an attempt. Failed attempts also
/// record the error; successful ones clear it.
pub async fn record_attempt(
    pool: &PgPool,
    stream_id: Uuid,
    block_height: i64,
    delivered: bool,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stream_metrics
            (stream_id, total_deliveries, failed_deliveries, last_triggered_at, last_triggered_block, last_error)
        VALUES ($1, 1, $2, now(), $3, $4)
        ON CONFLICT (stream_id) DO UPDATE SET
            total_deliveries = stream_metrics.total_deliveries + 1,
            failed_deliveries = stream_metrics.failed_deliveries + $2,
            last_triggered_at = now(),
            last_triggered_block = $3,
            last_error = $4
        "#,
    )
    .bind(stream_id)
    .bind(if delivered { 0i64 } else { 1i64 })
    .bind(block_height)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Current counters for a stream
pub async fn get_metrics(pool: &PgPool, stream_id: Uuid) -> Result<Option<StreamMetrics>> {
    let metrics = sqlx::query_as::<_, StreamMetrics>(
        "SELECT stream_id, total_deliveries, failed_deliveries, last_triggered_at,
                last_triggered_block, last_error
         FROM stream_metrics WHERE stream_id = $1",
    )
    .bind(stream_id)
    .fetch_optional(pool)
    .await?;
    Ok(metrics)
}
