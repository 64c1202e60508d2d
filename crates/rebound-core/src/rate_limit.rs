//! Process-wide token-bucket rate limiting.
//!
//! A single [`RateLimiter`] caps the request rate of every fetcher in the
//! process. Tokens refill continuously at `rate` per second up to
//! `capacity`; each outbound request consumes one.
//!
//! # Example
//!
//! ```rust,no_run
//! use rebound_core::rate_limit::RateLimiter;
//!
//! # async fn run() -> Result<(), rebound_core::error::AppError> {
//! // 2 requests/second, bursts of up to 5
//! let limiter = RateLimiter::init_global(2.0, 5);
//! limiter.admit(1.0).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

/// Wait used when the bucket is empty and does not refill (`rate == 0`).
const ZERO_RATE_POLL: Duration = Duration::from_millis(100);

/// Longest single sleep before the bucket is re-tested.
const MAX_REFILL_WAIT: Duration = Duration::from_secs(60);

static GLOBAL_LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
///
/// Only the refill/test/deduct section runs under the lock; waiting callers
/// sleep outside it and re-test afterwards, since concurrent consumers may
/// have drained the bucket in the meantime.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket. `capacity` is clamped to at least 1 and a
    /// negative or non-finite `rate` is treated as 0.
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let rate = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
        Self {
            capacity,
            rate,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Initialise the process-wide limiter. Later calls return the instance
    /// created by the first one and ignore their arguments.
    pub fn init_global(rate: f64, capacity: u32) -> Arc<RateLimiter> {
        GLOBAL_LIMITER
            .get_or_init(|| {
                tracing::info!(rate, capacity, "Global rate limiter initialized");
                Arc::new(RateLimiter::new(rate, capacity))
            })
            .clone()
    }

    /// The process-wide limiter, if [`init_global`](Self::init_global) ran.
    pub fn global() -> Option<Arc<RateLimiter>> {
        GLOBAL_LIMITER.get().cloned()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Acquires the bucket lock, recovering from poison if necessary.
    fn lock_bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.last_refill = now;
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(f64::from(self.capacity));
    }

    /// Refill, then deduct `cost` if available. On shortfall returns the
    /// minimal wait before the bucket could hold `cost` tokens.
    fn try_acquire(&self, cost: f64) -> Result<(), Duration> {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Ok(());
        }
        if self.rate > 0.0 {
            let wait = Duration::try_from_secs_f64((cost - bucket.tokens) / self.rate)
                .map_or(MAX_REFILL_WAIT, |wait| wait.min(MAX_REFILL_WAIT));
            Err(wait)
        } else {
            Err(ZERO_RATE_POLL)
        }
    }

    /// Wait until `cost` tokens are available, then consume them.
    ///
    /// A `cost <= 0` returns immediately. A cost larger than the bucket
    /// capacity can never be satisfied and is rejected.
    pub async fn admit(&self, cost: f64) -> Result<(), AppError> {
        if cost <= 0.0 || cost.is_nan() {
            return Ok(());
        }
        if cost > f64::from(self.capacity) {
            return Err(AppError::ConfigError(format!(
                "Rate limiter cost {cost} exceeds bucket capacity {}",
                self.capacity
            )));
        }

        loop {
            match self.try_acquire(cost) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tracing::debug!(wait_ms = %wait.as_millis(), "Rate limited, waiting for tokens");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Consume `cost` tokens if they are available right now.
    pub fn try_admit(&self, cost: f64) -> bool {
        if cost <= 0.0 || cost.is_nan() {
            return true;
        }
        self.try_acquire(cost).is_ok()
    }

    /// Current token count after refilling.
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        bucket.tokens
    }
}
