//! OpenAI chat adapter
//!
//! The gateway's public dialect is already OpenAI-shaped, so this adapter
//! passes the request through mostly untouched and re-emits upstream SSE
//! chunks verbatim after decoding.

use crate::client::{classify_transport_error, upstream_error};
use crate::retry_after::{parse_rate_limit_headers, RateLimitHook};
use crate::sse::{cancel_on, sse_data_stream};
use futures::StreamExt;
use polygate_core::{
    ChatProvider, ChatRequest, ChatResponse, ChatStream, Error, ProviderId, Result, StreamChunk,
};
use tokio_util::sync::CancellationToken;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limit_hook: Option<RateLimitHook>,
}

impl OpenAiProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        rate_limit_hook: Option<RateLimitHook>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limit_hook,
        }
    }

    fn harvest_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(hook) = &self.rate_limit_hook {
            if let Some(info) = parse_rate_limit_headers(headers) {
                hook(ProviderId::OpenAi, info);
            }
        }
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let mut body = request.clone();
        body.stream = stream.then_some(true);
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::OpenAi, e))?;

        self.harvest_headers(response.headers());

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(ProviderId::OpenAi, status.as_u16(), &text));
        }
        Ok(response)
    }

    async fn send_inner(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post(request, false).await?;
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| classify_transport_error(ProviderId::OpenAi, e))
    }

    async fn stream_inner(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.post(request, true).await?;
        let data = sse_data_stream(ProviderId::OpenAi, response.bytes_stream());
        let chunks = data
            .take_while(|item| {
                let done = matches!(item, Ok(payload) if payload == "[DONE]");
                futures::future::ready(!done)
            })
            .map(|item| {
                item.and_then(|payload| {
                    serde_json::from_str::<StreamChunk>(&payload).map_err(Error::from)
                })
            })
            .boxed();
        Ok(chunks)
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    async fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.send_inner(request) => result,
        }
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatStream> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.stream_inner(request) => result?,
        };
        Ok(cancel_on(stream, cancel.clone()).boxed())
    }
}
