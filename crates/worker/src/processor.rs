//! Per-job processing: filter evaluation, signing, dispatch, accounting

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use secondlayer_core::filters::{FilterMatch, StreamFilters};
use secondlayer_core::signing;
use secondlayer_core::types::{
    BlockRecord, DeliveryStatus, JobRecord, StreamOptions, StreamRecord,
};
use secondlayer_core::{Config, Error, Result};
use secondlayer_storage::streams::{self, NewDelivery};
use secondlayer_storage::{blocks, JobQueue, Store};

use crate::rate_limit::RateLimiter;

/// How one delivery attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { http_status: u16 },
    /// Client errors and unexpected redirects; retrying cannot help
    PermanentFailure { http_status: Option<u16>, reason: String },
    /// Server errors, throttling, and network faults
    RetryableFailure { http_status: Option<u16>, reason: String },
}

/// Classify an HTTP status per the webhook contract: 2xx delivered, 3xx and
/// 4xx permanent (except 429), 5xx and 429 retryable.
pub fn classify_status(status: u16) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Delivered { http_status: status },
        429 => DeliveryOutcome::RetryableFailure {
            http_status: Some(status),
            reason: "rate limited by receiver".to_string(),
        },
        300..=499 => DeliveryOutcome::PermanentFailure {
            http_status: Some(status),
            reason: format!("receiver returned {}", status),
        },
        _ => DeliveryOutcome::RetryableFailure {
            http_status: Some(status),
            reason: format!("receiver returned {}", status),
        },
    }
}

/// Exponential backoff for retryable failures, capped at five minutes
pub fn retry_delay(attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, 8) as u32;
    Duration::from_secs(2u64.pow(exponent).min(300))
}

/// Processes claimed jobs end to end
pub struct JobProcessor {
    store: Store,
    queue: JobQueue,
    http: reqwest::Client,
    config: Config,
    rate_limiter: RateLimiter,
}

impl JobProcessor {
    pub fn new(store: Store, queue: JobQueue, config: Config) -> Result<Self> {
        // Redirects are a permanent failure by contract, so never follow them.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::network(format!("webhook client: {}", e)))?;
        Ok(Self {
            store,
            queue,
            http,
            config,
            rate_limiter: RateLimiter::new(),
        })
    }

    /// Process one claimed job. Store-level errors mark the job failed and
    /// re-queue it under the attempts cap, the same path as a retryable
    /// webhook failure.
    pub async fn process(&self, job: JobRecord) {
        match self.process_inner(&job).await {
            Ok(()) => {}
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Job processing failed");
                let reason = e.to_string();
                if let Err(e) = self.queue.fail(job.id, &reason).await {
                    warn!(job_id = job.id, error = %e, "Failed to mark job failed");
                    return;
                }
                if e.is_retryable() {
                    self.maybe_requeue(&job).await;
                }
            }
        }
    }

    async fn process_inner(&self, job: &JobRecord) -> Result<()> {
        let Some(stream) = streams::get_stream(self.store.pool(), job.stream_id).await? else {
            debug!(job_id = job.id, "Stream gone, completing as no-op");
            return self.queue.complete(job.id).await;
        };

        if !stream.is_active() {
            debug!(job_id = job.id, stream = %stream.name, "Stream not active, completing as no-op");
            return self.queue.complete(job.id).await;
        }

        let filters = match StreamFilters::parse(&stream.filters) {
            Ok(filters) => filters,
            Err(e) => {
                // A malformed filter can never match; failing permanently
                // keeps the queue from spinning on it.
                warn!(stream = %stream.name, error = %e, "Invalid stream filters");
                return self.queue.fail(job.id, &format!("invalid filters: {}", e)).await;
            }
        };

        let Some((block, transactions, events)) =
            blocks::block_with_data(self.store.pool(), job.block_height).await?
        else {
            // The canonical block vanished under this job: a reorg landed
            // between enqueue and claim. Reorg handling already failed the
            // height's jobs; this claim lost the race.
            return self
                .queue
                .fail(job.id, "canonical block missing (reorg)")
                .await;
        };

        let matched = filters.apply(&transactions, &events);
        if matched.is_empty() {
            return self.queue.complete(job.id).await;
        }

        let outcome = self.deliver(job, &stream, &block, &matched).await?;
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.queue.complete(job.id).await,
            DeliveryOutcome::PermanentFailure { .. } => {
                // Recorded in the delivery row; the job itself is done.
                self.queue.complete(job.id).await
            }
            DeliveryOutcome::RetryableFailure { reason, .. } => {
                self.queue.fail(job.id, &reason).await?;
                self.maybe_requeue(job).await;
                Ok(())
            }
        }
    }

    /// Sign, POST, and record one webhook attempt
    async fn deliver(
        &self,
        job: &JobRecord,
        stream: &StreamRecord,
        block: &BlockRecord,
        matched: &FilterMatch,
    ) -> Result<DeliveryOutcome> {
        // Streams may cap their own delivery rate via options.
        let options = stream.delivery_options();
        let wait = self
            .rate_limiter
            .reserve(stream.id, options.rate_limit_per_sec);
        if wait > Duration::ZERO {
            debug!(stream = %stream.name, wait_ms = wait.as_millis() as u64, "Rate limit wait");
            tokio::time::sleep(wait).await;
        }

        let payload = build_payload(stream, block, matched, &options);
        let body = serde_json::to_string(&payload)?;
        let timestamp = Utc::now().timestamp();
        let signature = signing::signature_header(&stream.webhook_secret, timestamp, &body);
        let delivery_id = Uuid::new_v4();

        let start = Instant::now();
        let response = self
            .http
            .post(&stream.webhook_url)
            .header("Content-Type", "application/json")
            .header(signing::SIGNATURE_HEADER, signature)
            .header("X-Delivery-Id", delivery_id.to_string())
            .header("User-Agent", "SecondLayer/1")
            .body(body)
            .send()
            .await;
        let response_time_ms = start.elapsed().as_millis() as i32;

        let outcome = match response {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(e) => DeliveryOutcome::RetryableFailure {
                http_status: None,
                reason: format!("network error: {}", e),
            },
        };

        let (status, http_status, error) = match &outcome {
            DeliveryOutcome::Delivered { http_status } => {
                (DeliveryStatus::Delivered, Some(*http_status as i32), None)
            }
            DeliveryOutcome::PermanentFailure { http_status, reason } => (
                DeliveryStatus::Failed,
                http_status.map(|s| s as i32),
                Some(reason.clone()),
            ),
            DeliveryOutcome::RetryableFailure { http_status, reason } => (
                DeliveryStatus::Failed,
                http_status.map(|s| s as i32),
                Some(reason.clone()),
            ),
        };

        streams::insert_delivery(
            self.store.pool(),
            &NewDelivery {
                stream_id: stream.id,
                job_id: Some(job.id),
                block_height: job.block_height,
                status,
                http_status,
                response_time_ms: Some(response_time_ms),
                attempts: job.attempts,
                error: error.clone(),
                payload,
            },
        )
        .await?;

        streams::record_attempt(
            self.store.pool(),
            stream.id,
            job.block_height,
            status == DeliveryStatus::Delivered,
            error.as_deref(),
        )
        .await?;

        info!(
            stream = %stream.name,
            block_height = job.block_height,
            delivered = status == DeliveryStatus::Delivered,
            http_status,
            response_time_ms,
            "Webhook attempt recorded"
        );
        Ok(outcome)
    }

    /// Re-queue a failed job with backoff while under the attempts cap
    async fn maybe_requeue(&self, job: &JobRecord) {
        // The claim already bumped attempts; job.attempts is current.
        if job.attempts >= self.config.webhook_max_attempts {
            warn!(
                job_id = job.id,
                attempts = job.attempts,
                "Attempts cap reached, leaving job failed"
            );
            return;
        }
        let delay = retry_delay(job.attempts);
        if let Err(e) = self.queue.requeue(job.id, delay).await {
            warn!(job_id = job.id, error = %e, "Failed to re-queue job");
        }
    }
}

/// Build the webhook body for one block and its matched data. Raw
/// transaction bytes are stripped unless the stream opted in.
pub fn build_payload(
    stream: &StreamRecord,
    block: &BlockRecord,
    matched: &FilterMatch,
    options: &StreamOptions,
) -> serde_json::Value {
    let transactions: Vec<_> = matched
        .transactions
        .iter()
        .map(|tx| {
            let mut tx = tx.clone();
            if !options.include_raw_tx {
                tx.raw_tx = None;
            }
            tx
        })
        .collect();

    json!({
        "stream_id": stream.id,
        "block_height": block.height,
        "block_hash": block.hash,
        "timestamp": block.timestamp,
        "events": matched.events,
        "transactions": transactions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn status_classification_follows_contract() {
        assert!(matches!(classify_status(200), DeliveryOutcome::Delivered { .. }));
        assert!(matches!(classify_status(204), DeliveryOutcome::Delivered { .. }));
        assert!(matches!(
            classify_status(301),
            DeliveryOutcome::PermanentFailure { .. }
        ));
        assert!(matches!(
            classify_status(404),
            DeliveryOutcome::PermanentFailure { .. }
        ));
        assert!(matches!(
            classify_status(429),
            DeliveryOutcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify_status(500),
            DeliveryOutcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify_status(503),
            DeliveryOutcome::RetryableFailure { .. }
        ));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
        assert_eq!(retry_delay(20), Duration::from_secs(300));
        assert_eq!(retry_delay(-1), Duration::from_secs(1));
    }

    fn test_stream() -> StreamRecord {
        StreamRecord {
            id: Uuid::new_v4(),
            name: "s".to_string(),
            status: "active".to_string(),
            filters: json!({}),
            options: json!({}),
            webhook_url: "https://example.com".to_string(),
            webhook_secret: "secret".to_string(),
            owner_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_block() -> BlockRecord {
        BlockRecord {
            height: 100,
            hash: "A".to_string(),
            parent_hash: "Z".to_string(),
            burn_block_height: 1,
            timestamp: 1_700_000_000,
            canonical: true,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn payload_carries_block_identity() {
        let payload = build_payload(
            &test_stream(),
            &test_block(),
            &FilterMatch::default(),
            &StreamOptions::default(),
        );
        assert_eq!(payload["block_height"], 100);
        assert_eq!(payload["block_hash"], "A");
        assert_eq!(payload["timestamp"], 1_700_000_000i64);
        assert!(payload["events"].as_array().unwrap().is_empty());
    }

    #[test]
    fn raw_tx_is_stripped_unless_opted_in() {
        use secondlayer_core::types::TransactionRecord;

        let matched = FilterMatch {
            transactions: vec![TransactionRecord {
                tx_id: "0x1".to_string(),
                block_height: 100,
                block_hash: "A".to_string(),
                tx_index: 0,
                tx_type: "token_transfer".to_string(),
                sender: "SP1".to_string(),
                status: "success".to_string(),
                contract_id: None,
                function_name: None,
                raw_tx: Some("00ff".to_string()),
            }],
            events: vec![],
        };

        let stripped = build_payload(
            &test_stream(),
            &test_block(),
            &matched,
            &StreamOptions::default(),
        );
        assert!(stripped["transactions"][0]["raw_tx"].is_null());

        let kept = build_payload(
            &test_stream(),
            &test_block(),
            &matched,
            &StreamOptions {
                include_raw_tx: true,
                ..StreamOptions::default()
            },
        );
        assert_eq!(kept["transactions"][0]["raw_tx"], "00ff");
    }
}
