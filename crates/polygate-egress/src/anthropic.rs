//! Anthropic messages adapter
//!
//! Translates between the gateway's OpenAI dialect and the Anthropic
//! messages API: system messages move into the `system` field, stream
//! events (`content_block_delta`, `message_delta`) are folded into
//! OpenAI-shape chunks.

use crate::client::{classify_transport_error, upstream_error};
use crate::retry_after::{parse_rate_limit_headers, RateLimitHook};
use crate::sse::{cancel_on, sse_data_stream};
use futures::StreamExt;
use polygate_core::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatStream, Choice, Delta, Error,
    ProviderId, Result, Role, Stop, StreamChoice, StreamChunk, Usage,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires max_tokens; used when the client omits it.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limit_hook: Option<RateLimitHook>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// One SSE event payload; only the variants the gateway folds into chunks.
#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

fn stop_sequences(stop: &Option<Stop>) -> Vec<String> {
    match stop {
        None => vec![],
        Some(Stop::One(sequence)) => vec![sequence.clone()],
        Some(Stop::Many(sequences)) => sequences.clone(),
    }
}

fn build_request<'a>(request: &'a ChatRequest, stream: bool) -> MessagesRequest<'a> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(&message.content),
            Role::User => messages.push(WireMessage {
                role: "user",
                content: &message.content,
            }),
            Role::Assistant => messages.push(WireMessage {
                role: "assistant",
                content: &message.content,
            }),
        }
    }
    MessagesRequest {
        model: &request.model,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: stop_sequences(&request.stop),
        stream: stream.then_some(true),
    }
}

impl AnthropicProvider {
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

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let body = build_request(request, stream);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Anthropic, e))?;

        if let Some(hook) = &self.rate_limit_hook {
            if let Some(info) = parse_rate_limit_headers(response.headers()) {
                hook(ProviderId::Anthropic, info);
            }
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(ProviderId::Anthropic, status.as_u16(), &text));
        }
        Ok(response)
    }

    async fn send_inner(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post(request, false).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Anthropic, e))?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        Ok(ChatResponse {
            id: format!("chatcmpl-{}", parsed.id),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason: parsed.stop_reason.as_deref().map(map_stop_reason),
            }],
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn stream_inner(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.post(request, true).await?;
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let model = request.model.clone();
        let created = chrono::Utc::now().timestamp();

        let data = sse_data_stream(ProviderId::Anthropic, response.bytes_stream());
        let chunks = data
            .filter_map(move |item| {
                let id = id.clone();
                let model = model.clone();
                async move {
                    let payload = match item {
                        Ok(payload) => payload,
                        Err(error) => return Some(Err(error)),
                    };
                    let event: StreamEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(error) => return Some(Err(Error::from(error))),
                    };
                    let chunk = |delta: Delta, finish: Option<String>, usage: Option<Usage>| {
                        StreamChunk {
                            id,
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model,
                            choices: vec![StreamChoice {
                                index: 0,
                                delta,
                                finish_reason: finish,
                            }],
                            usage,
                        }
                    };
                    match event.kind.as_str() {
                        "content_block_delta" => {
                            let text = event.delta.and_then(|d| d.text)?;
                            Some(Ok(chunk(
                                Delta {
                                    role: None,
                                    content: Some(text),
                                },
                                None,
                                None,
                            )))
                        }
                        "message_delta" => {
                            let finish = event
                                .delta
                                .and_then(|d| d.stop_reason)
                                .as_deref()
                                .map(map_stop_reason);
                            let usage = event.usage.map(|u| Usage {
                                prompt_tokens: u.input_tokens,
                                completion_tokens: u.output_tokens,
                                total_tokens: u.input_tokens + u.output_tokens,
                            });
                            Some(Ok(chunk(Delta::default(), finish, usage)))
                        }
                        // message_start, content_block_start/stop, ping...
                        _ => None,
                    }
                }
            })
            .boxed();
        Ok(chunks)
    }
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(content: &str) -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: "be terse".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: content.to_string(),
                },
            ],
            temperature: Some(0.5),
            max_tokens: Some(64),
            top_p: None,
            stream: None,
            stop: None,
        }
    }

    #[test]
    fn test_build_request_moves_system_out_of_messages() {
        let req = request("hi");
        let wire = build_request(&req, false);
        assert_eq!(wire.system.as_deref(), Some("be terse"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.max_tokens, 64);
    }

    #[test]
    fn test_build_request_defaults_max_tokens() {
        let mut req = request("hi");
        req.max_tokens = None;
        let wire = build_request(&req, false);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("stop_sequence"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_use");
    }

    #[tokio::test]
    async fn test_send_translates_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(header("x-api-key", "sk-ant-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_abc",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": "pong"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new(reqwest::Client::new(), server.uri(), "sk-ant-test", None);
        let response = provider
            .send(&request("ping"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.first_content(), Some("pong"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 12);
        assert!(response.id.starts_with("chatcmpl-"));
    }

    #[tokio::test]
    async fn test_send_sets_stream_false_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(serde_json::json!({"max_tokens": 64})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_abc",
                "model": "claude-sonnet-4-20250514",
                "content": [],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new(reqwest::Client::new(), server.uri(), "sk-ant-test", None);
        provider
            .send(&request("ping"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_folds_events_into_chunks() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_abc\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"po\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ng\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new(reqwest::Client::new(), server.uri(), "sk-ant-test", None);
        let stream = provider
            .stream(&request("ping"), &CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("po"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("ng"));
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[2].usage.map(|u| u.completion_tokens), Some(2));
    }

    #[tokio::test]
    async fn test_upstream_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new(reqwest::Client::new(), server.uri(), "sk-ant-test", None);
        let error = provider
            .send(&request("ping"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.upstream_status(), Some(429));
        assert_eq!(error.provider(), Some(ProviderId::Anthropic));
    }
}
