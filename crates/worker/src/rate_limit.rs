//! Per-stream delivery rate limiting
//!
//! Process-local token buckets keyed by stream. The limit itself comes from
//! each stream's options row, so a config change takes effect on the next
//! claimed job without any shared mutable state across processes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets for all streams this worker has delivered to
pub struct RateLimiter {
    buckets: Mutex<HashMap<Uuid, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve one delivery slot for a stream limited to `per_sec` requests
    /// per second. Returns how long the caller must wait before sending;
    /// reservations queue, so concurrent callers space themselves out.
    pub fn reserve(&self, stream_id: Uuid, per_sec: f64) -> Duration {
        if per_sec <= 0.0 {
            return Duration::ZERO;
        }

        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(stream_id).or_insert(TokenBucket {
            tokens: per_sec.max(1.0),
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_sec).min(per_sec.max(1.0));
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / per_sec)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
