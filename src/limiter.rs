//! Dual-resource token-bucket rate limiter.
//!
//! Each logical endpoint gets one [`RateLimiter`] holding two independent
//! [`TokenBucket`]s — token volume and request count. Both buckets refill
//! continuously at `capacity / 60` units per second, so a bucket regenerates
//! its full per-minute budget once per minute. Refill is computed lazily on
//! each access and clamped at capacity.
//!
//! Admission control is the only backpressure mechanism in the pipeline:
//! when capacity is exhausted, callers suspend on a short poll interval
//! instead of failing.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::models::ModelSpec;

/// How often a blocked consumer re-checks the bucket.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LimiterError {
    /// The request can never succeed regardless of wait.
    #[error("requested {requested} units exceeds bucket capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },
}

struct BucketState {
    level: f64,
    last_refill: Instant,
}

/// One token bucket guarding a single resource.
///
/// The lock is scoped to each refill-and-deduct sequence, so concurrent
/// consumers never observe a partially refilled or double-deducted bucket.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket that refills at `capacity / 60` per second.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            rate: f64::from(capacity) / 60.0,
            state: Mutex::new(BucketState {
                level: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Deduct `amount` units, suspending until enough capacity exists.
    ///
    /// An `amount` of zero is a no-op and never blocks. An `amount` larger
    /// than the bucket's total capacity fails immediately with
    /// [`LimiterError::CapacityExceeded`].
    pub async fn consume(&self, amount: u32) -> Result<(), LimiterError> {
        if amount == 0 {
            return Ok(());
        }
        if f64::from(amount) > self.capacity {
            return Err(LimiterError::CapacityExceeded {
                requested: amount,
                capacity: self.capacity as u32,
            });
        }

        let mut waited = false;
        loop {
            {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.level >= f64::from(amount) {
                    state.level -= f64::from(amount);
                    return Ok(());
                }
            }
            if !waited {
                debug!(amount, "waiting for rate-limit capacity");
                waited = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Deduct `amount` without waiting.
    ///
    /// Used for the post-hoc output-token charge, where the true volume is
    /// only known after the response returns. The deduction is a plain
    /// subtraction: a large charge pushes the level below zero, and the
    /// overdraft self-corrects on subsequent refills. Only the upper bound
    /// is clamped.
    pub async fn charge(&self, amount: u32) {
        if amount == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.level -= f64::from(amount);
    }

    /// Current level after a lazy refill. May be negative after a charge.
    pub async fn level(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.level
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.level = (state.level + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }
}

/// Token-volume and request-count buckets for one model endpoint.
pub struct RateLimiter {
    tokens: TokenBucket,
    requests: TokenBucket,
}

impl RateLimiter {
    pub fn new(tokens_per_minute: u32, requests_per_minute: u32) -> Self {
        Self {
            tokens: TokenBucket::new(tokens_per_minute),
            requests: TokenBucket::new(requests_per_minute),
        }
    }

    pub fn for_spec(spec: &ModelSpec) -> Self {
        Self::new(spec.tokens_per_minute, spec.requests_per_minute)
    }

    /// Acquire `tokens` units of token volume and one request slot.
    ///
    /// Both buckets are consumed concurrently so their waits overlap rather
    /// than compound. The token bucket is polled first, so an over-capacity
    /// request fails before the request slot is touched.
    pub async fn acquire(&self, tokens: u32) -> Result<(), LimiterError> {
        tokio::try_join!(self.tokens.consume(tokens), self.requests.consume(1))?;
        Ok(())
    }

    /// Charge consumed output tokens back against the token bucket; may
    /// overdraw, see [`TokenBucket::charge`].
    pub async fn charge_output(&self, tokens: u32) {
        self.tokens.charge(tokens).await;
    }

    pub async fn token_level(&self) -> f64 {
        self.tokens.level().await
    }
}
