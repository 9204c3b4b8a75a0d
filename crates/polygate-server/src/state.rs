//! Application state container
//!
//! One explicit struct of sub-registries built after config load and
//! passed through axum state. Nothing in the gateway lives in module-level
//! globals, so tests construct fresh instances per case.

use crate::config::GatewayConfig;
use dashmap::DashMap;
use polygate_cache::{EmbeddingConfig, HttpEmbedder, InMemoryVectorStore, SemanticCache, SemanticCacheConfig};
use polygate_core::{ModelCatalog, ProviderId, Result};
use polygate_egress::{HttpClientConfig, ProviderDispatcher, ProviderEndpoint, RateLimitHook};
use polygate_observability::{CostTracker, ErrorTracker, RequestCounter};
use polygate_routing::{
    FallbackOptions, LatencyTracker, LatencyTrackerConfig, ModelSelector, ProviderRegistry,
    RegistryConfig, RulesEngine, RulesEngineConfig, TokenBucket,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Per-provider token buckets, lazily constructed on first reference.
pub struct BucketMap {
    config: Arc<GatewayConfig>,
    buckets: DashMap<ProviderId, Arc<TokenBucket>>,
}

impl BucketMap {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn bucket(&self, provider: ProviderId) -> Result<Arc<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(&provider) {
            return Ok(Arc::clone(&bucket));
        }
        let settings = self.config.bucket_settings(provider);
        let bucket = Arc::new(TokenBucket::new(settings.max_tokens, settings.refill_rate)?);
        Ok(Arc::clone(
            self.buckets.entry(provider).or_insert(bucket).value(),
        ))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub catalog: Arc<ModelCatalog>,
    pub registry: Arc<ProviderRegistry>,
    pub selector: Arc<ModelSelector>,
    pub dispatcher: Arc<ProviderDispatcher>,
    pub buckets: Arc<BucketMap>,
    pub cache: Option<Arc<SemanticCache>>,
    pub counter: Arc<RequestCounter>,
    pub costs: Arc<CostTracker>,
    pub errors: Arc<ErrorTracker>,
    /// Flipped by the shutdown handler; the gate middleware serves 503
    /// while set.
    pub draining: Arc<AtomicBool>,
}

impl AppState {
    /// Wire every subsystem from validated configuration.
    pub fn build(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let catalog = Arc::new(ModelCatalog::builtin());

        let tracker = Arc::new(LatencyTracker::new(LatencyTrackerConfig {
            window: config.latency.window,
            alpha: config.latency.alpha,
        }));
        let registry = Arc::new(ProviderRegistry::new(
            config.provider_ids(),
            RegistryConfig {
                error_threshold: config.breaker.error_threshold,
                cooldown: config.breaker.cooldown,
            },
            tracker,
        ));

        let engine = RulesEngine::new(
            config.routing.rules.clone(),
            ModelCatalog::builtin(),
            RulesEngineConfig {
                default_latency_ms: 500.0,
                default_strategy: config.routing.default_strategy,
            },
        );
        let selector = Arc::new(ModelSelector::new(
            Arc::clone(&registry),
            engine,
            FallbackOptions {
                max_retries: config.routing.max_retries,
                base_backoff: config.routing.base_backoff,
                max_backoff: config.routing.max_backoff,
                streaming: false,
            },
        ));

        let hook_registry = Arc::clone(&registry);
        let rate_limit_hook: RateLimitHook = Arc::new(move |provider, info| {
            hook_registry.update_rate_limit(provider, info.remaining, info.reset_at);
        });
        let endpoints = config
            .providers
            .iter()
            .map(|settings| {
                ProviderEndpoint::new(
                    settings.provider,
                    settings.base_url.clone(),
                    settings.api_key.clone(),
                )
            })
            .collect();
        let dispatcher = Arc::new(ProviderDispatcher::new(
            endpoints,
            &HttpClientConfig::default(),
            Some(rate_limit_hook),
        )?);

        let cache = if config.cache.enabled {
            let embedder = HttpEmbedder::new(EmbeddingConfig {
                endpoint: config.cache.embedding_endpoint.clone(),
                api_key: config.cache.embedding_api_key.clone(),
                model: config.cache.embedding_model.clone(),
                dimensions: config.cache.embedding_dimensions,
                ..EmbeddingConfig::default()
            })?;
            Some(Arc::new(SemanticCache::new(
                Arc::new(embedder),
                Arc::new(InMemoryVectorStore::new()),
                SemanticCacheConfig {
                    enabled: true,
                    ttl: config.cache.ttl,
                    distance_threshold: config.cache.distance_threshold,
                    ..SemanticCacheConfig::default()
                },
            )))
        } else {
            None
        };

        let counter = Arc::new(RequestCounter::new());
        let costs = Arc::new(CostTracker::new(
            ModelCatalog::builtin(),
            Arc::clone(&counter),
            256,
        ));
        let errors = Arc::new(ErrorTracker::new(Arc::clone(&counter), 256));

        Ok(Self {
            buckets: Arc::new(BucketMap::new(Arc::clone(&config))),
            config,
            catalog,
            registry,
            selector,
            dispatcher,
            cache,
            counter,
            costs,
            errors,
            draining: Arc::new(AtomicBool::new(false)),
        })
    }
}
