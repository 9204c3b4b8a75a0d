//! Environment-driven configuration with startup validation
//!
//! Every knob reads from a `POLYGATE_*` variable. Validation runs once at
//! startup and refuses to boot on inconsistent settings, most importantly
//! the deadline dominance invariant: the global request timeout must cover
//! every per-provider timeout, or the outer deadline could never be the
//! binding constraint it is specified to be.

use polygate_core::{Error, ProviderId, Result, RoutingStrategy};
use polygate_routing::rules::RoutingRule;
use std::str::FromStr;
use std::time::Duration;

/// Minimum length of the gateway API key.
pub const MIN_API_KEY_LEN: usize = 32;
/// Body size limit for `/v1/chat/completions` (1 MiB).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
/// `X-Timeout-Ms` clamp bounds.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: ProviderId,
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Bucket overrides; global defaults apply when unset.
    pub bucket_max_tokens: Option<f64>,
    pub bucket_refill_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_tokens: f64,
    pub refill_rate: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_tokens: 60.0,
            refill_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub default_strategy: RoutingStrategy,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::Balanced,
            max_retries: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub distance_threshold: f32,
    pub embedding_endpoint: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub embedding_dimensions: Option<u32>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(3600),
            distance_threshold: 0.15,
            embedding_endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            embedding_api_key: String::new(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatencySettings {
    pub window: usize,
    pub alpha: f64,
}

impl Default for LatencySettings {
    fn default() -> Self {
        Self {
            window: 100,
            alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub error_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// The shared key protecting `/v1/*` and `/metrics*`.
    pub api_key: String,
    /// Default end-to-end deadline when no header or provider timeout
    /// applies.
    pub request_timeout: Duration,
    pub providers: Vec<ProviderSettings>,
    pub rate_limit: RateLimitSettings,
    pub routing: RoutingSettings,
    pub cache: CacheSettings,
    pub latency: LatencySettings,
    pub breaker: BreakerSettings,
    /// Estimate stream usage as ceil(chars/4) when the provider omits it.
    pub estimate_stream_usage: bool,
    /// Pass upstream error messages through to clients (never in prod).
    pub expose_upstream_errors: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}"))),
    }
}

fn provider_from_env(provider: ProviderId, default_timeout: Duration) -> Result<Option<ProviderSettings>> {
    let upper = provider.as_str().to_uppercase();
    let Some(api_key) = env_var(&format!("POLYGATE_{upper}_API_KEY")) else {
        return Ok(None);
    };
    let base_url = env_var(&format!("POLYGATE_{upper}_BASE_URL")).unwrap_or_else(|| {
        polygate_egress::ProviderEndpoint::default_base_url(provider).to_string()
    });
    let timeout = env_parse::<u64>(&format!("POLYGATE_{upper}_TIMEOUT_MS"))?
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    Ok(Some(ProviderSettings {
        provider,
        api_key,
        base_url,
        timeout,
        bucket_max_tokens: env_parse::<f64>(&format!("POLYGATE_{upper}_RATE_LIMIT_MAX"))?,
        bucket_refill_rate: env_parse::<f64>(&format!("POLYGATE_{upper}_RATE_LIMIT_REFILL"))?,
    }))
}

impl GatewayConfig {
    /// Load from the environment. Missing optional values fall back to
    /// defaults; malformed values are startup errors.
    pub fn from_env() -> Result<Self> {
        let api_key = env_var("POLYGATE_API_KEY")
            .ok_or_else(|| Error::Config("POLYGATE_API_KEY is required".to_string()))?;

        let request_timeout = env_parse::<u64>("POLYGATE_REQUEST_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(60));
        let default_provider_timeout = env_parse::<u64>("POLYGATE_PROVIDER_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));

        let mut providers = Vec::new();
        for provider in ProviderId::ALL {
            if let Some(settings) = provider_from_env(provider, default_provider_timeout)? {
                providers.push(settings);
            }
        }

        let rate_limit = RateLimitSettings {
            max_tokens: env_parse::<f64>("POLYGATE_RATE_LIMIT_MAX")?.unwrap_or(60.0),
            refill_rate: env_parse::<f64>("POLYGATE_RATE_LIMIT_REFILL")?.unwrap_or(1.0),
        };

        let routing = RoutingSettings {
            default_strategy: env_parse::<RoutingStrategy>("POLYGATE_ROUTING_STRATEGY")?
                .unwrap_or_default(),
            max_retries: env_parse::<u32>("POLYGATE_MAX_RETRIES")?.unwrap_or(2),
            base_backoff: env_parse::<u64>("POLYGATE_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(200)),
            max_backoff: env_parse::<u64>("POLYGATE_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(5)),
            rules: match env_var("POLYGATE_ROUTING_RULES") {
                None => Vec::new(),
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("invalid POLYGATE_ROUTING_RULES: {e}")))?,
            },
        };

        let cache = CacheSettings {
            enabled: env_parse::<bool>("POLYGATE_CACHE_ENABLED")?.unwrap_or(false),
            ttl: env_parse::<u64>("POLYGATE_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(3600)),
            distance_threshold: env_parse::<f32>("POLYGATE_CACHE_THRESHOLD")?.unwrap_or(0.15),
            embedding_endpoint: env_var("POLYGATE_EMBEDDING_ENDPOINT")
                .unwrap_or_else(|| CacheSettings::default().embedding_endpoint),
            embedding_api_key: env_var("POLYGATE_EMBEDDING_API_KEY").unwrap_or_default(),
            embedding_model: env_var("POLYGATE_EMBEDDING_MODEL")
                .unwrap_or_else(|| CacheSettings::default().embedding_model),
            embedding_dimensions: env_parse::<u32>("POLYGATE_EMBEDDING_DIMS")?,
        };

        let latency = LatencySettings {
            window: env_parse::<usize>("POLYGATE_LATENCY_WINDOW")?.unwrap_or(100),
            alpha: env_parse::<f64>("POLYGATE_LATENCY_ALPHA")?.unwrap_or(0.3),
        };

        let breaker = BreakerSettings {
            error_threshold: env_parse::<u32>("POLYGATE_BREAKER_THRESHOLD")?.unwrap_or(5),
            cooldown: env_parse::<u64>("POLYGATE_BREAKER_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
        };

        let config = Self {
            host: env_var("POLYGATE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse::<u16>("POLYGATE_PORT")?.unwrap_or(8080),
            api_key,
            request_timeout,
            providers,
            rate_limit,
            routing,
            cache,
            latency,
            breaker,
            estimate_stream_usage: env_parse::<bool>("POLYGATE_ESTIMATE_STREAM_USAGE")?
                .unwrap_or(false),
            expose_upstream_errors: env_parse::<bool>("POLYGATE_EXPOSE_UPSTREAM_ERRORS")?
                .unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup invariants.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.len() < MIN_API_KEY_LEN {
            return Err(Error::Config(format!(
                "gateway API key must be at least {MIN_API_KEY_LEN} characters"
            )));
        }
        if self.providers.is_empty() {
            return Err(Error::Config(
                "at least one provider API key must be configured".to_string(),
            ));
        }
        for settings in &self.providers {
            if self.request_timeout < settings.timeout {
                return Err(Error::Config(format!(
                    "request timeout {:?} is shorter than the {} provider timeout {:?}",
                    self.request_timeout, settings.provider, settings.timeout
                )));
            }
        }
        if self.rate_limit.max_tokens <= 0.0 || self.rate_limit.refill_rate <= 0.0 {
            return Err(Error::Config(
                "rate limit max tokens and refill rate must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.latency.alpha) {
            return Err(Error::Config(
                "latency alpha must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.latency.window == 0 {
            return Err(Error::Config("latency window must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Deadline for a request: header value (clamped) wins, then the
    /// detected provider's timeout, then the global default.
    pub fn resolve_timeout(
        &self,
        header_ms: Option<u64>,
        provider: Option<ProviderId>,
    ) -> Duration {
        if let Some(ms) = header_ms {
            return Duration::from_millis(ms.clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS));
        }
        provider
            .and_then(|p| self.provider(p))
            .map(|settings| settings.timeout)
            .unwrap_or(self.request_timeout)
    }

    pub fn provider(&self, provider: ProviderId) -> Option<&ProviderSettings> {
        self.providers.iter().find(|s| s.provider == provider)
    }

    /// Bucket parameters for one provider, overrides applied.
    pub fn bucket_settings(&self, provider: ProviderId) -> RateLimitSettings {
        let settings = self.provider(provider);
        RateLimitSettings {
            max_tokens: settings
                .and_then(|s| s.bucket_max_tokens)
                .unwrap_or(self.rate_limit.max_tokens),
            refill_rate: settings
                .and_then(|s| s.bucket_refill_rate)
                .unwrap_or(self.rate_limit.refill_rate),
        }
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|s| s.provider).collect()
    }
}
