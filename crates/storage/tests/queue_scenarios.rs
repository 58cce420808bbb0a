//! Queue behavior against a live database.
//!
//! These tests need a scratch Postgres pointed to by DATABASE_URL and are
//! ignored by default; they truncate pipeline tables, so never point them at
//! real data. Run serially:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/secondlayer_test \
//!     cargo test -p secondlayer-storage -- --ignored --test-threads=1
//! ```

use std::time::Duration;

use uuid::Uuid;

use secondlayer_core::Config;
use secondlayer_storage::{JobQueue, Store};

async fn test_store() -> Store {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL required for ignored tests");
    let config = Config {
        database_url,
        ..Config::default()
    };
    Store::connect(&config).await.expect("connect to scratch database")
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

async fn seed_stream(store: &Store) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO streams (name, webhook_url, webhook_secret)
         VALUES ('test-stream', 'https://example.com/hook', 's3cret')
         RETURNING id",
    )
    .fetch_one(store.pool())
    .await
    .expect("seed stream")
}

async fn enqueue_one(store: &Store, queue: &JobQueue, stream_id: Uuid, height: i64) -> u64 {
    let mut tx = store.pool().begin().await.expect("begin");
    let inserted = queue
        .enqueue_batch(&mut tx, &[stream_id], height, false)
        .await
        .expect("enqueue");
    tx.commit().await.expect("commit");
    inserted
}

#[tokio::test]
#[ignore]
async fn enqueue_is_idempotent_per_stream_and_block() {
    let store = test_store().await;
    reset(&store).await;
    let queue = JobQueue::new(store.clone());
    let stream_id = seed_stream(&store).await;

    assert_eq!(enqueue_one(&store, &queue, stream_id, 100).await, 1);
    assert_eq!(enqueue_one(&store, &queue, stream_id, 100).await, 0);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore]
async fn claim_is_exclusive_across_workers() {
    let store = test_store().await;
    reset(&store).await;
    let queue = JobQueue::new(store.clone());
    let stream_id = seed_stream(&store).await;
    enqueue_one(&store, &queue, stream_id, 100).await;

    // Two workers race for the single pending job.
    let (first, second) = tokio::join!(queue.claim("worker-a"), queue.claim("worker-b"));
    let first = first.expect("claim a");
    let second = second.expect("claim b");

    assert!(
        first.is_some() != second.is_some(),
        "exactly one worker must win the claim"
    );

    let job = first.or(second).unwrap();
    assert_eq!(job.status, "processing");
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_some());

    queue.complete(job.id).await.expect("complete");
    let completed = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, "completed");
    assert_eq!(completed.attempts, 1);
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
#[ignore]
async fn claim_orders_by_height_then_age() {
    let store = test_store().await;
    reset(&store).await;
    let queue = JobQueue::new(store.clone());
    let stream_id = seed_stream(&store).await;

    enqueue_one(&store, &queue, stream_id, 105).await;
    enqueue_one(&store, &queue, stream_id, 101).await;
    enqueue_one(&store, &queue, stream_id, 103).await;

    let heights: Vec<i64> = [
        queue.claim("w").await.unwrap().unwrap().block_height,
        queue.claim("w").await.unwrap().unwrap().block_height,
        queue.claim("w").await.unwrap().unwrap().block_height,
    ]
    .into();
    assert_eq!(heights, vec![101, 103, 105]);
    assert!(queue.claim("w").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn recover_promotes_stale_claims() {
    let store = test_store().await;
    reset(&store).await;
    let queue = JobQueue::new(store.clone());
    let stream_id = seed_stream(&store).await;
    enqueue_one(&store, &queue, stream_id, 100).await;

    let job = queue.claim("crashed-worker").await.unwrap().unwrap();

    // Fresh claims survive recovery.
    assert_eq!(queue.recover(Duration::from_secs(300)).await.unwrap(), 0);

    // Age the claim past the stale threshold.
    sqlx::query("UPDATE jobs SET locked_at = now() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(job.id)
        .execute(store.pool())
        .await
        .unwrap();

    assert_eq!(queue.recover(Duration::from_secs(300)).await.unwrap(), 1);

    let recovered = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, "pending");
    assert!(recovered.locked_at.is_none());
    assert!(recovered.locked_by.is_none());

    // No processing job older than the threshold remains.
    let stale: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs
         WHERE status = 'processing' AND locked_at < now() - INTERVAL '5 minutes'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(stale, 0);
}

#[tokio::test]
#[ignore]
async fn requeued_job_waits_for_its_retry_time() {
    let store = test_store().await;
    reset(&store).await;
    let queue = JobQueue::new(store.clone());
    let stream_id = seed_stream(&store).await;
    enqueue_one(&store, &queue, stream_id, 100).await;

    let job = queue.claim("w").await.unwrap().unwrap();
    queue.fail(job.id, "receiver returned 503").await.unwrap();
    queue.requeue(job.id, Duration::from_secs(3600)).await.unwrap();

    // Pending but not yet claimable.
    let pending = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(pending.status, "pending");
    assert!(queue.claim("w").await.unwrap().is_none());

    // Collapse the retry window; the job becomes claimable again.
    sqlx::query("UPDATE jobs SET next_retry_at = now() WHERE id = $1")
        .bind(job.id)
        .execute(store.pool())
        .await
        .unwrap();
    let reclaimed = queue.claim("w").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
}
