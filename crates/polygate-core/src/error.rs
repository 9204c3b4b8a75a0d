//! Gateway-wide error type

use crate::provider::ProviderId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One attempt made by the fallback handler, kept for terminal error
/// reporting and operator logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: ProviderId,
    pub model: String,
    pub latency_ms: u64,
    /// `None` for the successful attempt
    pub error: Option<String>,
}

fn providers_tried(attempts: &[AttemptRecord]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for attempt in attempts {
        let name = attempt.provider.as_str();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen.join(", ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Request body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Rate limit exceeded for {provider}: retry after {retry_after_secs}s")]
    RateLimited {
        provider: ProviderId,
        retry_after_secs: u64,
        limit: u64,
        remaining: u64,
    },

    #[error("No provider available for this request")]
    NoProviderAvailable,

    #[error("Deadline exceeded after {} attempt(s)", attempts.len())]
    DeadlineExceeded { attempts: Vec<AttemptRecord> },

    #[error("All providers failed (tried: {})", providers_tried(attempts))]
    AllProvidersFailed { attempts: Vec<AttemptRecord> },

    #[error("Upstream {provider} returned status {status}: {message}")]
    Upstream {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    #[error("Network error talking to {provider}: {message}")]
    Network {
        provider: ProviderId,
        message: String,
    },

    /// The request's cancellation token fired while an operation was in
    /// flight. The fallback handler turns this into `DeadlineExceeded`.
    #[error("Request cancelled")]
    Cancelled,

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Upstream status code, when this error carries one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The provider this error is attributable to, if any.
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            Error::Upstream { provider, .. }
            | Error::Network { provider, .. }
            | Error::RateLimited { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
