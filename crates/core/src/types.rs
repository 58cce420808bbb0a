//! Entity types shared by the pipeline services
//!
//! These mirror the durable tables. No entity holds references to another in
//! memory; rows carry ids and heights and the store provides identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A block as stored. At most one canonical block exists per height; rows are
/// never deleted, a reorg flips `canonical` instead.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block height
    pub height: i64,

    /// Block hash
    pub hash: String,

    /// Parent block hash
    pub parent_hash: String,

    /// Burn chain height this block is anchored to
    pub burn_block_height: i64,

    /// Block timestamp in seconds since UNIX epoch (0 for genesis)
    pub timestamp: i64,

    /// Whether this block is on the accepted chain
    pub canonical: bool,

    /// When the row was first written
    pub received_at: DateTime<Utc>,
}

/// A transaction row. A row whose block hash no longer matches the
/// canonical block at its height is orphaned: kept for audit, never served
/// as live chain data. Re-mined transactions are re-pointed at their new
/// block on insert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction id
    pub tx_id: String,

    /// Height of the containing block
    pub block_height: i64,

    /// Hash of the containing block; ties the row to one block version
    pub block_hash: String,

    /// Position within the block
    pub tx_index: i32,

    /// Transaction type (token_transfer, contract_call, ...)
    pub tx_type: String,

    /// Sender address
    pub sender: String,

    /// Execution status as reported by the node
    pub status: String,

    /// Contract principal for calls and deploys
    pub contract_id: Option<String>,

    /// Function name for contract calls
    pub function_name: Option<String>,

    /// Raw encoded transaction bytes, hex
    pub raw_tx: Option<String>,
}

/// An event row, identified by (tx_id, event_index). Same orphaning
/// lifecycle as its transaction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventRecord {
    /// Surrogate id
    pub id: i64,

    /// Transaction the event belongs to
    pub tx_id: String,

    /// Height of the containing block
    pub block_height: i64,

    /// Hash of the containing block; ties the row to one block version
    pub block_hash: String,

    /// Index within the transaction
    pub event_index: i32,

    /// Event type tag
    pub event_type: String,

    /// Original structured payload, kept opaque
    pub payload: serde_json::Value,
}

/// Index watermarks, one row per network.
/// Invariant: last_contiguous_block <= last_indexed_block <= highest_seen_block.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IndexProgress {
    /// Network identifier
    pub network: String,

    /// Highest persisted canonical height
    pub last_indexed_block: i64,

    /// Highest H such that [min stored height, H] is fully canonical
    pub last_contiguous_block: i64,

    /// Highest height ever observed, persisted or not
    pub highest_seen_block: i64,

    /// Last upsert time
    pub updated_at: DateTime<Utc>,
}

/// Stream lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Paused,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Paused => "paused",
        }
    }
}

/// A webhook subscription: filters plus a destination
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Stream id
    pub id: Uuid,

    /// Human-readable name
    pub name: String,

    /// active | paused
    pub status: String,

    /// Filter object (parsed by `filters::StreamFilters`)
    pub filters: serde_json::Value,

    /// Free-form delivery options
    pub options: serde_json::Value,

    /// Destination URL
    pub webhook_url: String,

    /// HMAC secret for the signature header
    pub webhook_secret: String,

    /// Owning account (enforced by the API layer, preserved here)
    pub owner_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamRecord {
    /// Whether the worker should deliver for this stream
    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active.as_str()
    }

    /// Parsed delivery options with defaults for anything unset
    pub fn delivery_options(&self) -> StreamOptions {
        StreamOptions::parse(&self.options)
    }
}

/// Delivery options carried in a stream's options column. Unknown keys are
/// ignored so the API layer can store its own settings alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Cap on deliveries per second for this stream; 0 disables the cap
    #[serde(default)]
    pub rate_limit_per_sec: f64,

    /// Include raw transaction bytes in webhook payloads
    #[serde(default)]
    pub include_raw_tx: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 0.0,
            include_raw_tx: false,
        }
    }
}

impl StreamOptions {
    /// Tolerant parse: a malformed options object falls back to defaults
    /// rather than blocking delivery.
    pub fn parse(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Per-stream delivery counters
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub stream_id: Uuid,
    pub total_deliveries: i64,
    pub failed_deliveries: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_triggered_block: Option<i64>,
    pub last_error: Option<String>,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// One unit of work: deliver stream S's payload for block H
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id
    pub id: i64,

    /// Stream to deliver for
    pub stream_id: Uuid,

    /// Block the delivery covers
    pub block_height: i64,

    /// pending | processing | completed | failed
    pub status: String,

    /// Number of claims so far
    pub attempts: i32,

    /// When the current claim was taken
    pub locked_at: Option<DateTime<Utc>>,

    /// Worker holding the claim
    pub locked_by: Option<String>,

    /// Last failure reason
    pub last_error: Option<String>,

    /// Whether this job came from a backfill replay
    pub backfill: bool,

    /// Earliest time a retried job becomes claimable again
    pub next_retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Delivery outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Immutable audit record of a single webhook attempt
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub stream_id: Uuid,

    /// Null when the job row was cleaned up by a reorg
    pub job_id: Option<i64>,

    pub block_height: i64,

    /// delivered | failed
    pub status: String,

    /// HTTP status code, if a response was received
    pub http_status: Option<i32>,

    /// Round-trip latency in milliseconds
    pub response_time_ms: Option<i32>,

    pub attempts: i32,
    pub error: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// View lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewStatus {
    Active,
    Paused,
    Error,
}

impl ViewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewStatus::Active => "active",
            ViewStatus::Paused => "paused",
            ViewStatus::Error => "error",
        }
    }
}

/// A materialized view: source filters plus a handler writing into a
/// dedicated physical schema.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViewRecord {
    pub id: Uuid,
    pub name: String,
    pub version: i32,

    /// active | paused | error
    pub status: String,

    /// Schema description + source filters (parsed by the views crate)
    pub definition: serde_json::Value,

    /// Hash of the definition the physical schema was built from
    pub schema_hash: String,

    /// Handler identifier resolved through the registry
    pub handler: String,

    /// Highest block this view has applied
    pub last_processed_block: i64,

    /// Consecutive handler failures
    pub error_count: i32,

    pub last_error: Option<String>,
    pub owner_id: Option<Uuid>,

    /// Physical schema name, `view_<name>`
    pub schema_name: String,
}

impl ViewRecord {
    pub fn is_active(&self) -> bool {
        self.status == ViewStatus::Active.as_str()
    }
}
