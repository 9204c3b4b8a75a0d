//! Fallback handler: per-provider retry plus cross-provider failover
//!
//! One overall deadline token governs the whole chain. Every attempt runs
//! under a fresh child token linked to the deadline; the previous attempt's
//! token is cancelled before the next attempt starts so abandoned upstream
//! calls release their connections promptly. Backoff sleeps race the
//! deadline.
//!
//! Terminal outcomes:
//! - `Error::DeadlineExceeded` when the deadline trips before any success,
//! - `Error::AllProvidersFailed` when every provider exhausts its attempts.

use crate::retry;
use crate::rules::RankedProvider;
use polygate_core::{AttemptRecord, Error, ProviderId, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Retries per provider on top of the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Streaming requests get a single attempt per provider so a client
    /// never sees two partial streams.
    pub streaming: bool,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            streaming: false,
        }
    }
}

/// A successful fallback resolution with its attempt history.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub provider: ProviderId,
    pub model: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Try each ranked provider in order, retrying transient failures within a
/// provider, until one succeeds or the deadline trips.
///
/// The execute callback receives the per-attempt cancellation token; it
/// must abandon work when that token (or the deadline it is linked to)
/// fires.
pub async fn run_with_fallback<T, F, Fut>(
    ranked: &[RankedProvider],
    deadline: &CancellationToken,
    options: &FallbackOptions,
    execute: F,
) -> Result<FallbackOutcome<T>>
where
    F: Fn(ProviderId, String, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if ranked.is_empty() {
        return Err(Error::NoProviderAvailable);
    }

    let attempts_per_provider = if options.streaming {
        1
    } else {
        options.max_retries + 1
    };
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    for candidate in ranked {
        for attempt_index in 0..attempts_per_provider {
            if deadline.is_cancelled() {
                return Err(Error::DeadlineExceeded { attempts });
            }

            let attempt_token = deadline.child_token();
            let started = Instant::now();
            let result = execute(
                candidate.provider,
                candidate.model.clone(),
                attempt_token.clone(),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        latency_ms,
                        error: None,
                    });
                    return Ok(FallbackOutcome {
                        value,
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        attempts,
                    });
                }
                Err(error) => {
                    tracing::debug!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        attempt = attempt_index,
                        error = %error,
                        "upstream attempt failed"
                    );
                    let cancelled = matches!(error, Error::Cancelled);
                    attempts.push(AttemptRecord {
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        latency_ms,
                        error: Some(error.to_string()),
                    });
                    // Release whatever the failed attempt left in flight
                    // before sleeping or moving on.
                    attempt_token.cancel();

                    if cancelled || deadline.is_cancelled() {
                        return Err(Error::DeadlineExceeded { attempts });
                    }

                    if retry::is_retryable(&error) && attempt_index + 1 < attempts_per_provider {
                        let delay = retry::backoff_with_jitter(
                            attempt_index,
                            options.base_backoff,
                            options.max_backoff,
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = deadline.cancelled() => {
                                return Err(Error::DeadlineExceeded { attempts });
                            }
                        }
                        continue;
                    }

                    // Non-retryable or out of retries: next provider.
                    break;
                }
            }
        }
    }

    Err(Error::AllProvidersFailed { attempts })
}
