//! Rate-limit header harvesting
//!
//! Providers report quota in `x-ratelimit-*` and `retry-after` headers.
//! `retry-after` comes in two formats: seconds ("60") or an HTTP-date
//! (RFC 7231). Values are capped at 48 hours so a misconfigured upstream
//! cannot park a provider indefinitely; daily-quota responses near 24h are
//! real and pass through with a warning.

use chrono::{DateTime, Utc};
use polygate_core::ProviderId;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cap on retry-after values (48 hours).
const MAX_RETRY_AFTER_SECS: u64 = 172_800;
/// Warn above this threshold (24 hours): usually a daily quota.
const WARN_THRESHOLD_SECS: u64 = 86_400;

/// Quota numbers harvested from one upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
}

/// Callback the server wires to `ProviderRegistry::update_rate_limit`.
pub type RateLimitHook = Arc<dyn Fn(ProviderId, RateLimitInfo) + Send + Sync>;

/// Parse a `retry-after` header value into seconds, capped at 48 hours.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    if let Ok(seconds) = header_value.trim().parse::<u64>() {
        return Some(apply_cap(seconds));
    }

    if let Ok(target) = DateTime::parse_from_rfc2822(header_value) {
        let delta = target.signed_duration_since(Utc::now()).num_seconds();
        if delta > 0 {
            return Some(apply_cap(delta as u64));
        }
        // A past date means retry immediately.
        return Some(0);
    }

    debug!(header_value, "unparseable retry-after header");
    None
}

fn apply_cap(seconds: u64) -> u64 {
    if seconds > MAX_RETRY_AFTER_SECS {
        warn!(
            seconds,
            cap = MAX_RETRY_AFTER_SECS,
            "retry-after exceeds cap, clamping"
        );
        return MAX_RETRY_AFTER_SECS;
    }
    if seconds > WARN_THRESHOLD_SECS {
        warn!(seconds, "retry-after longer than 24h, likely a daily quota");
    }
    seconds
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Harvest rate-limit state from upstream response headers. Returns `None`
/// when the response carries no usable quota information.
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = header_u64(headers, "x-ratelimit-remaining-requests")
        .or_else(|| header_u64(headers, "x-ratelimit-remaining"))
        .or_else(|| header_u64(headers, "anthropic-ratelimit-requests-remaining"));

    let retry_after_secs = headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);

    let reset_at = retry_after_secs.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

    match (remaining, retry_after_secs) {
        (None, None) => None,
        (remaining, retry_after_secs) => Some(RateLimitInfo {
            // A bare retry-after implies the quota is exhausted right now.
            remaining: remaining.unwrap_or(0),
            reset_at,
            retry_after_secs,
        }),
    }
}
