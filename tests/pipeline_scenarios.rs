//! Full-pipeline scenarios: ingest through the indexer, materialize through
//! the view processor's built-in handler, rewind on reorg.
//!
//! Ignored by default; truncates pipeline tables and drops view schemas.
//! Run serially against a scratch database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/secondlayer_test \
//!     cargo test --test pipeline_scenarios -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use serde_json::json;

use secondlayer_core::notify::ViewReorgPayload;
use secondlayer_core::Config;
use secondlayer_indexer::parse::NewBlockPayload;
use secondlayer_indexer::{BlockSource, IngestService, NodeClient};
use secondlayer_storage::Store;
use secondlayer_views::{HandlerRegistry, ViewProcessor};

fn test_config() -> Config {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL required for ignored tests");
    Config {
        database_url,
        network: "testnet".to_string(),
        // Nothing should reach the node in these tests; fail fast if it does.
        node_url: "http://127.0.0.1:1".to_string(),
        node_api_url: "http://127.0.0.1:1".to_string(),
        ..Config::default()
    }
}

async fn reset(store: &Store) {
    for table in [
        "jobs",
        "deliveries",
        "stream_metrics",
        "streams",
        "events",
        "transactions",
        "blocks",
        "index_progress",
        "views",
    ] {
        sqlx::query(&format!("TRUNCATE {} CASCADE", table))
            .execute(store.pool())
            .await
            .expect("truncate");
    }
    sqlx::query("DROP SCHEMA IF EXISTS view_transfers CASCADE")
        .execute(store.pool())
        .await
        .expect("drop view schema");
}

/// A transfers view fed by ft_transfer_event; deliberately no event_type
/// column, the canonical minimal config.
async fn seed_view(store: &Store) {
    let definition = json!({
        "sources": {"events": [{"type": "ft_transfer_event"}]},
        "tables": [{
            "name": "transfers",
            "columns": [
                {"name": "sender", "type": "text", "indexed": true},
                {"name": "recipient", "type": "text"},
                {"name": "amount", "type": "text"}
            ],
            "source": "ft_transfer_event"
        }]
    });
    sqlx::query(
        "INSERT INTO views (name, definition, handler, schema_name)
         VALUES ('transfers', $1, 'tables', 'view_transfers')",
    )
    .bind(definition)
    .execute(store.pool())
    .await
    .expect("seed view");
}

fn block_payload(hash: &str, tx_id: &str, sender: &str, amount: &str) -> NewBlockPayload {
    serde_json::from_value(json!({
        "height": 100,
        "hash": hash,
        "parent_hash": "Z",
        "timestamp": 1700000000i64,
        "transactions": [
            {"tx_id": tx_id, "tx_index": 0, "type": "token_transfer", "sender": sender, "status": "success"}
        ],
        "events": [
            {"tx_id": tx_id, "event_index": 0, "type": "ft_transfer_event",
             "ft_transfer_event": {"sender": sender, "recipient": "SP2", "amount": amount}}
        ]
    }))
    .expect("payload")
}

async fn view_rows(store: &Store) -> Vec<(i64, String, String, String)> {
    sqlx::query_as(
        "SELECT _block_height, _tx_id, sender, amount
         FROM view_transfers.transfers ORDER BY _id",
    )
    .fetch_all(store.pool())
    .await
    .expect("view rows")
}

async fn view_progress(store: &Store) -> (i64, i32) {
    sqlx::query_as(
        "SELECT last_processed_block, error_count FROM views WHERE name = 'transfers'",
    )
    .fetch_one(store.pool())
    .await
    .expect("view row")
}

#[tokio::test]
#[ignore]
async fn tables_handler_materializes_ingested_events_and_survives_reorg() {
    let config = test_config();
    let store = Store::connect(&config).await.expect("connect");
    reset(&store).await;
    seed_view(&store).await;

    let node = Arc::new(NodeClient::new(&config).expect("node client"));
    let ingest = IngestService::new(store.clone(), node, config.network.clone());

    ingest
        .ingest_block(block_payload("A", "0xt1", "SP1", "42"), BlockSource::Push)
        .await
        .expect("ingest block 100");

    let registry = Arc::new(HandlerRegistry::with_defaults());
    let processor = ViewProcessor::new(store.clone(), config, registry);
    processor.reload_views().await.expect("reload views");
    processor.catch_up().await.expect("catch up");

    // The default handler walked the real ingested data into the view.
    let (last_processed, error_count) = view_progress(&store).await;
    assert_eq!(last_processed, 100);
    assert_eq!(error_count, 0, "handler must not error on the minimal config");

    let rows = view_rows(&store).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0],
        (100, "0xt1".to_string(), "SP1".to_string(), "42".to_string())
    );

    // Reorg at 100: a different block with a different transfer.
    ingest
        .ingest_block(block_payload("A2", "0xt2", "SP9", "7"), BlockSource::Push)
        .await
        .expect("ingest replacement block");

    processor
        .rewind(&ViewReorgPayload {
            block_height: 100,
            old_hash: "A".to_string(),
            new_hash: "A2".to_string(),
        })
        .await
        .expect("rewind");

    let (last_processed, _) = view_progress(&store).await;
    assert_eq!(last_processed, 99);
    assert!(view_rows(&store).await.is_empty());

    // Reprocessing serves only the replacement block's data; the orphaned
    // transfer from block A stays out of the view.
    processor.catch_up().await.expect("catch up after rewind");

    let (last_processed, error_count) = view_progress(&store).await;
    assert_eq!(last_processed, 100);
    assert_eq!(error_count, 0);

    let rows = view_rows(&store).await;
    assert_eq!(rows.len(), 1, "only the canonical block's event may appear");
    assert_eq!(
        rows[0],
        (100, "0xt2".to_string(), "SP9".to_string(), "7".to_string())
    );
}
