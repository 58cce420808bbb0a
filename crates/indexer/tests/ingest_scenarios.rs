//! End-to-end ingest scenarios against a live database.
//!
//! Ignored by default; they truncate pipeline tables. Run serially against a
//! scratch database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/secondlayer_test \
//!     cargo test -p secondlayer-indexer -- --ignored --test-threads=1
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use secondlayer_core::notify::VIEW_REORG_CHANNEL;
use secondlayer_core::Config;
use secondlayer_indexer::parse::NewBlockPayload;
use secondlayer_indexer::{BlockSource, IngestOutcome, IngestService, NodeClient};
use secondlayer_storage::{blocks, Store};

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

async fn test_ingest() -> (Store, Arc<IngestService>, Config) {
    let config = test_config();
    let store = Store::connect(&config).await.expect("connect");
    let node = Arc::new(NodeClient::new(&config).expect("node client"));
    let ingest = Arc::new(IngestService::new(
        store.clone(),
        node,
        config.network.clone(),
    ));
    (store, ingest, config)
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
    ] {
        sqlx::query(&format!("TRUNCATE {} CASCADE", table))
            .execute(store.pool())
            .await
            .expect("truncate");
    }
}

async fn seed_stream(store: &Store) {
    sqlx::query(
        "INSERT INTO streams (name, webhook_url, webhook_secret)
         VALUES ('all-blocks', 'https://example.com/hook', 's3cret')",
    )
    .execute(store.pool())
    .await
    .expect("seed stream");
}

fn payload(value: serde_json::Value) -> NewBlockPayload {
    serde_json::from_value(value).expect("payload")
}

fn block_100() -> NewBlockPayload {
    payload(json!({
        "height": 100,
        "hash": "A",
        "parent_hash": "Z",
        "timestamp": 1700000000i64,
        "transactions": [
            {"tx_id": "0xt1", "tx_index": 0, "type": "token_transfer", "sender": "SP1", "status": "success"},
            {"tx_id": "0xt2", "tx_index": 1, "type": "contract_call", "sender": "SP2", "status": "success",
             "contract_id": "SP9.counter", "function_name": "increment"}
        ],
        "events": [
            {"tx_id": "0xt1", "event_index": 0, "type": "stx_transfer_event",
             "stx_transfer_event": {"sender": "SP1", "amount": "100"}},
            {"tx_id": "0xt2", "event_index": 0, "type": "smart_contract_log",
             "smart_contract_log": {"contract_id": "SP9.counter", "value": "1"}}
        ]
    }))
}

fn block_101(hash: &str) -> NewBlockPayload {
    payload(json!({
        "height": 101,
        "hash": hash,
        "parent_hash": "A",
        "timestamp": 1700000600i64
    }))
}

#[tokio::test]
#[ignore]
async fn happy_path_advances_watermark_and_enqueues_jobs() {
    let (store, ingest, config) = test_ingest().await;
    reset(&store).await;
    seed_stream(&store).await;

    let outcome = ingest
        .ingest_block(block_100(), BlockSource::Push)
        .await
        .expect("ingest 100");
    match outcome {
        IngestOutcome::Ok {
            block_height,
            transactions,
            events,
            jobs_enqueued,
        } => {
            assert_eq!(block_height, 100);
            assert_eq!(transactions, 2);
            assert_eq!(events, 2);
            assert_eq!(jobs_enqueued, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    ingest
        .ingest_block(block_101("B"), BlockSource::Push)
        .await
        .expect("ingest 101");

    for height in [100, 101] {
        assert!(blocks::canonical_block_at(store.pool(), height)
            .await
            .unwrap()
            .is_some());
    }

    let progress = blocks::get_progress(store.pool(), &config.network)
        .await
        .unwrap()
        .expect("progress row");
    assert_eq!(progress.last_contiguous_block, 101);
    assert_eq!(progress.last_indexed_block, 101);
    assert_eq!(progress.highest_seen_block, 101);

    let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(jobs, 2, "one job per active stream per block");

    let metrics = ingest.metrics();
    assert_eq!(metrics.last_seen_height.load(Ordering::Relaxed), 101);
    assert_eq!(
        metrics.blocks_received_out_of_order.load(Ordering::Relaxed),
        0
    );
}

#[tokio::test]
#[ignore]
async fn reorg_flips_canonical_fails_jobs_and_notifies() {
    let (store, ingest, _config) = test_ingest().await;
    reset(&store).await;
    seed_stream(&store).await;

    ingest
        .ingest_block(block_100(), BlockSource::Push)
        .await
        .unwrap();
    ingest
        .ingest_block(block_101("B"), BlockSource::Push)
        .await
        .unwrap();

    let mut listener = store.listener(&[VIEW_REORG_CHANNEL]).await.unwrap();

    // Same height, different hash: a reorg.
    ingest
        .ingest_block(block_101("B2"), BlockSource::Push)
        .await
        .unwrap();

    let old: (String, bool) = sqlx::query_as(
        "SELECT hash, canonical FROM blocks WHERE height = 101 AND hash = 'B'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(!old.1, "replaced block must lose canonical status");

    let canonical = blocks::canonical_block_at(store.pool(), 101)
        .await
        .unwrap()
        .expect("new canonical block");
    assert_eq!(canonical.hash, "B2");

    let failed: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT status, last_error FROM jobs WHERE block_height = 101",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert!(!failed.is_empty());
    for (status, last_error) in failed {
        assert_eq!(status, "failed");
        assert!(last_error.unwrap_or_default().contains("reorg"));
    }

    let notification = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("view_reorg notification")
        .unwrap();
    let reorg: serde_json::Value = serde_json::from_str(notification.payload()).unwrap();
    assert_eq!(reorg["blockHeight"], 101);
    assert_eq!(reorg["oldHash"], "B");
    assert_eq!(reorg["newHash"], "B2");
}

#[tokio::test]
#[ignore]
async fn out_of_order_blocks_become_contiguous_from_min_height() {
    let (store, ingest, config) = test_ingest().await;
    reset(&store).await;

    for value in [
        json!({"height": 102, "hash": "C", "parent_hash": "B"}),
        json!({"height": 100, "hash": "A", "parent_hash": "Z"}),
        json!({"height": 101, "hash": "B", "parent_hash": "A"}),
    ] {
        ingest
            .ingest_block(payload(value), BlockSource::Push)
            .await
            .unwrap();
    }

    for height in [100, 101, 102] {
        assert!(blocks::canonical_block_at(store.pool(), height)
            .await
            .unwrap()
            .is_some());
    }

    assert_eq!(
        ingest
            .metrics()
            .blocks_received_out_of_order
            .load(Ordering::Relaxed),
        1
    );

    // 102 anchored the non-genesis start; the contiguous run from the
    // minimum stored height covers everything once 100 and 101 land. The
    // integrity recompute reports the authoritative value.
    let mut conn = store.pool().acquire().await.unwrap();
    let min_height = blocks::min_canonical_height(&mut *conn).await.unwrap().unwrap();
    assert_eq!(min_height, 100);
    let tip = blocks::contiguous_tip_from(&mut conn, min_height)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tip, 102);

    let progress = blocks::get_progress(store.pool(), &config.network)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.highest_seen_block, 102);
}

#[tokio::test]
#[ignore]
async fn duplicate_ingest_is_idempotent() {
    let (store, ingest, _config) = test_ingest().await;
    reset(&store).await;
    seed_stream(&store).await;

    ingest
        .ingest_block(block_100(), BlockSource::Push)
        .await
        .unwrap();

    let counts_before: (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM blocks), (SELECT COUNT(*) FROM transactions),
                (SELECT COUNT(*) FROM events), (SELECT COUNT(*) FROM jobs)",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();

    let outcome = ingest
        .ingest_block(block_100(), BlockSource::Push)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Duplicate);

    let counts_after: (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM blocks), (SELECT COUNT(*) FROM transactions),
                (SELECT COUNT(*) FROM events), (SELECT COUNT(*) FROM jobs)",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(counts_before, counts_after);
}
