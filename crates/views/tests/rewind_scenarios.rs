//! View rewind behavior against a live database.
//!
//! Ignored by default; truncates pipeline tables and drops view schemas.
//! Run serially against a scratch database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/secondlayer_test \
//!     cargo test -p secondlayer-views -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use serde_json::json;

use secondlayer_core::notify::ViewReorgPayload;
use secondlayer_core::Config;
use secondlayer_storage::Store;
use secondlayer_views::{HandlerRegistry, ViewProcessor};

fn test_config() -> Config {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL required for ignored tests");
    Config {
        database_url,
        network: "testnet".to_string(),
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

async fn seed_view(store: &Store) {
    let definition = json!({
        "sources": {"events": [{"type": "ft_transfer_event"}]},
        "tables": [{
            "name": "transfers",
            "columns": [
                {"name": "sender", "type": "text", "indexed": true},
                {"name": "amount", "type": "text"}
            ],
            "source": "ft_transfer_event"
        }]
    });
    sqlx::query(
        "INSERT INTO views (name, definition, handler, last_processed_block, schema_name)
         VALUES ('transfers', $1, 'tables', 101, 'view_transfers')",
    )
    .bind(definition)
    .execute(store.pool())
    .await
    .expect("seed view");
}

#[tokio::test]
#[ignore]
async fn reorg_rewinds_progress_and_deletes_tip_rows() {
    let config = test_config();
    let store = Store::connect(&config).await.expect("connect");
    reset(&store).await;
    seed_view(&store).await;

    let registry = Arc::new(HandlerRegistry::with_defaults());
    let processor = ViewProcessor::new(store.clone(), config, registry);
    processor.reload_views().await.expect("reload views");

    // Rows the view wrote for blocks 99..=101.
    for (height, sender) in [(99, "SP1"), (100, "SP2"), (101, "SP3")] {
        sqlx::query(
            "INSERT INTO view_transfers.transfers (_block_height, _tx_id, sender, amount)
             VALUES ($1, $2, $3, '10')",
        )
        .bind(height)
        .bind(format!("0x{}", height))
        .bind(sender)
        .execute(store.pool())
        .await
        .expect("seed view rows");
    }

    processor
        .rewind(&ViewReorgPayload {
            block_height: 100,
            old_hash: "B".to_string(),
            new_hash: "B2".to_string(),
        })
        .await
        .expect("rewind");

    let last_processed: i64 =
        sqlx::query_scalar("SELECT last_processed_block FROM views WHERE name = 'transfers'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(last_processed, 99);

    let remaining: Vec<(i64, String)> = sqlx::query_as(
        "SELECT _block_height, sender FROM view_transfers.transfers ORDER BY _block_height",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(remaining.len(), 1, "rows at or above the reorg height are gone");
    assert_eq!(remaining[0], (99, "SP1".to_string()));
}

#[tokio::test]
#[ignore]
async fn views_below_the_reorg_height_are_untouched() {
    let config = test_config();
    let store = Store::connect(&config).await.expect("connect");
    reset(&store).await;
    seed_view(&store).await;

    // This view has only processed up to 50; a reorg at 100 is above it.
    sqlx::query("UPDATE views SET last_processed_block = 50 WHERE name = 'transfers'")
        .execute(store.pool())
        .await
        .unwrap();

    let registry = Arc::new(HandlerRegistry::with_defaults());
    let processor = ViewProcessor::new(store.clone(), config, registry);
    processor.reload_views().await.expect("reload views");

    processor
        .rewind(&ViewReorgPayload {
            block_height: 100,
            old_hash: "B".to_string(),
            new_hash: "B2".to_string(),
        })
        .await
        .expect("rewind");

    let last_processed: i64 =
        sqlx::query_scalar("SELECT last_processed_block FROM views WHERE name = 'transfers'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(last_processed, 50, "unaffected views keep their progress");
}
