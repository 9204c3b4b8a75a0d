//! Retryable classification and backoff math

use polygate_core::Error;
use rand::Rng;
use std::time::Duration;

/// Upstream statuses worth retrying: timeouts, throttling, and 5xx-class
/// transient failures.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Whether an error is worth another attempt against the same provider.
/// Network-class failures (connect, reset, dns, timeout) always are;
/// upstream responses only for the transient status set.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Upstream { status, .. } => RETRYABLE_STATUSES.contains(status),
        Error::Network { .. } => true,
        _ => false,
    }
}

/// Raw exponential backoff: `min(max, base * 2^attempt)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(max).min(max)
}

/// Backoff with ±20% uniform jitter so synchronized retries fan out.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = backoff_delay(attempt, base, max);
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor).min(max)
}
