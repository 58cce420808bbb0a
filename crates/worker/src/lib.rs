//! Worker service: drains the job queue and dispatches signed webhooks
//!
//! Fixed concurrency via a semaphore. Wakeups come from the `new_job`
//! channel with an interval poll as a safety net against missed
//! notifications. Shutdown stops claiming and waits for in-flight jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use secondlayer_core::notify::NEW_JOB_CHANNEL;
use secondlayer_core::{Config, Result};
use secondlayer_storage::{JobQueue, Store};

pub mod processor;
pub mod rate_limit;

pub use processor::{build_payload, classify_status, retry_delay, DeliveryOutcome, JobProcessor};
pub use rate_limit::RateLimiter;

/// Run the worker service until the shutdown signal flips
pub async fn run(config: Config, store: Store, shutdown: watch::Receiver<bool>) -> Result<()> {
    let queue = JobQueue::new(store.clone());
    let processor = Arc::new(JobProcessor::new(store.clone(), queue.clone(), config.clone())?);
    let worker_id = format!("worker-{}", Uuid::new_v4());
    let concurrency = config.worker_concurrency;
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let wakeup = Arc::new(Notify::new());

    info!(worker_id = %worker_id, concurrency, "Worker starting");

    // Stale-claim recovery: jobs abandoned by crashed workers go back to
    // pending on a timer.
    let recovery_task = tokio::spawn(recovery_loop(
        queue.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    // Dedicated listener connection; each notification nudges the drain.
    let listener_task = tokio::spawn(listen_loop(
        store.clone(),
        wakeup.clone(),
        shutdown.clone(),
    ));

    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut shutdown_rx = shutdown.clone();
    loop {
        drain(&queue, &processor, &semaphore, &worker_id, &shutdown).await;

        tokio::select! {
            _ = wakeup.notified() => {}
            _ = poll.tick() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Stop accepting; wait for active jobs by taking every permit.
    info!("Worker draining in-flight jobs");
    let _permits = semaphore
        .acquire_many(concurrency as u32)
        .await
        .map_err(|e| secondlayer_core::Error::storage(format!("semaphore closed: {}", e)))?;

    let _ = listener_task.await;
    let _ = recovery_task.await;
    info!("Worker stopped");
    Ok(())
}

/// Claim and spawn jobs until the queue is empty or shutdown begins
async fn drain(
    queue: &JobQueue,
    processor: &Arc<JobProcessor>,
    semaphore: &Arc<Semaphore>,
    worker_id: &str,
    shutdown: &watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let job = match queue.claim(worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Claim failed");
                tokio::time::sleep(Duration::from_millis(250)).await;
                return;
            }
        };

        debug!(job_id = job.id, block_height = job.block_height, "Claimed job");
        let processor = processor.clone();
        tokio::spawn(async move {
            processor.process(job).await;
            drop(permit);
        });
    }
}

/// Subscribe to new-job notifications; reconnect with a delay on failure
async fn listen_loop(store: Store, wakeup: Arc<Notify>, shutdown: watch::Receiver<bool>) {
    let mut shutdown = shutdown;
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut listener = match store.listener(&[NEW_JOB_CHANNEL]).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Notification listener failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                received = listener.recv() => {
                    match received {
                        Ok(_) => wakeup.notify_one(),
                        Err(e) => {
                            warn!(error = %e, "Notification connection lost");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Periodically promote stale processing claims back to pending
async fn recovery_loop(queue: JobQueue, config: Config, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.job_recovery_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        if let Err(e) = queue
            .recover(Duration::from_secs(config.job_stale_after_secs))
            .await
        {
            warn!(error = %e, "Stale-claim recovery failed");
        }
    }
}
