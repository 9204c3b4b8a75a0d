//! Provider dispatcher: one `ChatProvider` per configured upstream

use crate::anthropic::AnthropicProvider;
use crate::client::{create_client, HttpClientConfig};
use crate::google::GoogleProvider;
use crate::openai::OpenAiProvider;
use crate::retry_after::RateLimitHook;
use polygate_core::{
    ChatProvider, ChatRequest, ChatResponse, ChatStream, Error, ProviderId, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where one provider lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub provider: ProviderId,
    pub base_url: String,
    pub api_key: String,
}

impl ProviderEndpoint {
    pub fn new(provider: ProviderId, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Default public API endpoint for a provider.
    pub fn default_base_url(provider: ProviderId) -> &'static str {
        match provider {
            ProviderId::OpenAi => "https://api.openai.com",
            ProviderId::Anthropic => "https://api.anthropic.com",
            ProviderId::Google => "https://generativelanguage.googleapis.com",
        }
    }
}

/// Routes upstream calls to the adapter for a given provider id. This is
/// the execute seam the fallback handler drives.
pub struct ProviderDispatcher {
    providers: HashMap<ProviderId, Arc<dyn ChatProvider>>,
}

impl ProviderDispatcher {
    /// Build adapters for every configured endpoint over one shared pooled
    /// client.
    pub fn new(
        endpoints: Vec<ProviderEndpoint>,
        http: &HttpClientConfig,
        rate_limit_hook: Option<RateLimitHook>,
    ) -> Result<Self> {
        let client = create_client(http)?;
        let mut providers: HashMap<ProviderId, Arc<dyn ChatProvider>> = HashMap::new();
        for endpoint in endpoints {
            let adapter: Arc<dyn ChatProvider> = match endpoint.provider {
                ProviderId::OpenAi => Arc::new(OpenAiProvider::new(
                    client.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                    rate_limit_hook.clone(),
                )),
                ProviderId::Anthropic => Arc::new(AnthropicProvider::new(
                    client.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                    rate_limit_hook.clone(),
                )),
                ProviderId::Google => Arc::new(GoogleProvider::new(
                    client.clone(),
                    endpoint.base_url,
                    endpoint.api_key,
                    rate_limit_hook.clone(),
                )),
            };
            providers.insert(endpoint.provider, adapter);
        }
        Ok(Self { providers })
    }

    /// Build from pre-constructed adapters (used by tests to inject stubs).
    pub fn from_providers(providers: HashMap<ProviderId, Arc<dyn ChatProvider>>) -> Self {
        Self { providers }
    }

    pub fn configured(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.keys().copied().collect();
        ids.sort();
        ids
    }

    fn adapter(&self, provider: ProviderId) -> Result<&Arc<dyn ChatProvider>> {
        self.providers
            .get(&provider)
            .ok_or_else(|| Error::Config(format!("provider {provider} is not configured")))
    }

    pub async fn send(
        &self,
        provider: ProviderId,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        self.adapter(provider)?.send(request, cancel).await
    }

    pub async fn stream(
        &self,
        provider: ProviderId,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatStream> {
        self.adapter(provider)?.stream(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_urls() {
        assert!(ProviderEndpoint::default_base_url(ProviderId::OpenAi).contains("openai"));
        assert!(ProviderEndpoint::default_base_url(ProviderId::Anthropic).contains("anthropic"));
        assert!(ProviderEndpoint::default_base_url(ProviderId::Google).contains("google"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_a_config_error() {
        let dispatcher = ProviderDispatcher::new(
            vec![ProviderEndpoint::new(
                ProviderId::OpenAi,
                "http://localhost:9",
                "sk-test",
            )],
            &HttpClientConfig::default(),
            None,
        )
        .unwrap();

        assert_eq!(dispatcher.configured(), vec![ProviderId::OpenAi]);

        let request = ChatRequest {
            model: "claude".to_string(),
            messages: vec![],
            temperature: None,
            max_tokens: None,
            top_p: None,
            stream: None,
            stop: None,
        };
        let result = dispatcher
            .send(ProviderId::Anthropic, &request, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
