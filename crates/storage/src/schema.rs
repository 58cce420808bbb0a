//! Idempotent schema bootstrap
//!
//! Applied at startup by every service binary so any of them can bring up a
//! fresh database. Statements are `IF NOT EXISTS` throughout; re-running is a
//! no-op. In production the same DDL can be applied out of band before
//! deploys.

use sqlx::PgPool;
use tracing::info;

use secondlayer_core::Result;

/// All DDL statements, in dependency order
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        height            BIGINT NOT NULL,
        hash              TEXT NOT NULL,
        parent_hash       TEXT NOT NULL,
        burn_block_height BIGINT NOT NULL DEFAULT 0,
        timestamp         BIGINT NOT NULL DEFAULT 0,
        canonical         BOOLEAN NOT NULL DEFAULT TRUE,
        received_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (height, hash)
    )
    "#,
    // At most one canonical block per height
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_blocks_canonical_height
        ON blocks (height) WHERE canonical
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        tx_id         TEXT PRIMARY KEY,
        block_height  BIGINT NOT NULL,
        block_hash    TEXT NOT NULL,
        tx_index      INTEGER NOT NULL DEFAULT 0,
        tx_type       TEXT NOT NULL,
        sender        TEXT NOT NULL,
        status        TEXT NOT NULL,
        contract_id   TEXT,
        function_name TEXT,
        raw_tx        TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_block_height
        ON transactions (block_height)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id           BIGSERIAL PRIMARY KEY,
        tx_id        TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        block_hash   TEXT NOT NULL,
        event_index  INTEGER NOT NULL,
        event_type   TEXT NOT NULL,
        payload      JSONB NOT NULL DEFAULT '{}'::jsonb,
        UNIQUE (tx_id, event_index)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_block_height
        ON events (block_height)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_progress (
        network               TEXT PRIMARY KEY,
        last_indexed_block    BIGINT NOT NULL DEFAULT 0,
        last_contiguous_block BIGINT NOT NULL DEFAULT 0,
        highest_seen_block    BIGINT NOT NULL DEFAULT 0,
        updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS streams (
        id             UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name           TEXT NOT NULL,
        status         TEXT NOT NULL DEFAULT 'active',
        filters        JSONB NOT NULL DEFAULT '{}'::jsonb,
        options        JSONB NOT NULL DEFAULT '{}'::jsonb,
        webhook_url    TEXT NOT NULL,
        webhook_secret TEXT NOT NULL,
        owner_id       UUID,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stream_metrics (
        stream_id            UUID PRIMARY KEY,
        total_deliveries     BIGINT NOT NULL DEFAULT 0,
        failed_deliveries    BIGINT NOT NULL DEFAULT 0,
        last_triggered_at    TIMESTAMPTZ,
        last_triggered_block BIGINT,
        last_error           TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id            BIGSERIAL PRIMARY KEY,
        stream_id     UUID NOT NULL,
        block_height  BIGINT NOT NULL,
        status        TEXT NOT NULL DEFAULT 'pending',
        attempts      INTEGER NOT NULL DEFAULT 0,
        locked_at     TIMESTAMPTZ,
        locked_by     TEXT,
        last_error    TEXT,
        backfill      BOOLEAN NOT NULL DEFAULT FALSE,
        next_retry_at TIMESTAMPTZ,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at  TIMESTAMPTZ,
        UNIQUE (stream_id, block_height)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_claimable
        ON jobs (block_height, created_at) WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_processing_locked_at
        ON jobs (locked_at) WHERE status = 'processing'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliveries (
        id               BIGSERIAL PRIMARY KEY,
        stream_id        UUID NOT NULL,
        job_id           BIGINT,
        block_height     BIGINT NOT NULL,
        status           TEXT NOT NULL,
        http_status      INTEGER,
        response_time_ms INTEGER,
        attempts         INTEGER NOT NULL DEFAULT 1,
        error            TEXT,
        payload          JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_deliveries_stream_id
        ON deliveries (stream_id, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS views (
        id                   UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name                 TEXT NOT NULL UNIQUE,
        version              INTEGER NOT NULL DEFAULT 1,
        status               TEXT NOT NULL DEFAULT 'active',
        definition           JSONB NOT NULL DEFAULT '{}'::jsonb,
        schema_hash          TEXT NOT NULL DEFAULT '',
        handler              TEXT NOT NULL DEFAULT 'tables',
        last_processed_block BIGINT NOT NULL DEFAULT 0,
        error_count          INTEGER NOT NULL DEFAULT 0,
        last_error           TEXT,
        owner_id             UUID,
        schema_name          TEXT NOT NULL
    )
    "#,
];

/// Apply the schema to the connected database
pub async fn apply(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Schema bootstrap complete ({} statements)", SCHEMA.len());
    Ok(())
}
