//! Token-bucket admission control
//!
//! One bucket per provider. Refill is lazy: every operation first credits
//! `elapsed_seconds * refill_rate` tokens (capped at the bucket maximum)
//! from the monotonic clock, so there is no background task and acquire
//! stays O(1).

use polygate_core::{Error, Result};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketInner {
    /// Current tokens, fractional. Invariant: 0.0 <= tokens <= max.
    tokens: f64,
    last_refill: Instant,
}

/// A classical token bucket with fractional lazy refill.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// Fails when `max_tokens` or `refill_rate` is not strictly positive.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Result<Self> {
        if max_tokens <= 0.0 {
            return Err(Error::Config(format!(
                "token bucket max_tokens must be positive, got {max_tokens}"
            )));
        }
        if refill_rate <= 0.0 {
            return Err(Error::Config(format!(
                "token bucket refill_rate must be positive, got {refill_rate}"
            )));
        }
        Ok(Self {
            max_tokens,
            refill_rate,
            inner: Mutex::new(BucketInner {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        })
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        inner.last_refill = now;
    }

    /// Atomically refill, then take one token if at least one is present.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn remaining(&self) -> u64 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.refill(&mut inner);
        inner.tokens.floor() as u64
    }

    /// Configured capacity, for `X-RateLimit-Limit`.
    pub fn limit(&self) -> u64 {
        self.max_tokens.floor() as u64
    }

    /// Seconds until one token will be available: ceil(deficit / rate),
    /// at least 1 when the bucket cannot serve a request right now.
    pub fn retry_after_secs(&self) -> u64 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            return 0;
        }
        let deficit = 1.0 - inner.tokens;
        let secs = (deficit / self.refill_rate).ceil() as u64;
        secs.max(1)
    }
}
