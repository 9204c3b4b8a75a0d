//! Shared HTTP client utilities

use polygate_core::{Error, ProviderId, Result};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// HTTP client configuration shared by all provider adapters.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in seconds. This is the outer transport bound; the
    /// per-request deadline token usually fires first.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            user_agent: format!("polygate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create a pooled HTTP client with rustls.
pub fn create_client(config: &HttpClientConfig) -> Result<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))
}

/// Classify a transport-level reqwest failure.
pub fn classify_transport_error(provider: ProviderId, error: reqwest::Error) -> Error {
    Error::Network {
        provider,
        message: error.to_string(),
    }
}

/// Turn a non-2xx upstream response into the gateway error, truncating the
/// body so operator logs stay readable.
pub fn upstream_error(provider: ProviderId, status: u16, body: &str) -> Error {
    let mut message: String = body.chars().take(512).collect();
    if message.is_empty() {
        message = "(empty body)".to_string();
    }
    Error::Upstream {
        provider,
        status,
        message,
    }
}
