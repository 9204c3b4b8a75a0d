//! Google Gemini adapter
//!
//! Translates to the generateContent API: chat turns become `contents`
//! with user/model roles, system messages become the systemInstruction,
//! and streaming uses `streamGenerateContent?alt=sse`.

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

pub struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limit_hook: Option<RateLimitHook>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" => "content_filter".to_string(),
        other => other.to_lowercase(),
    }
}

fn build_request(request: &ChatRequest) -> GenerateRequest {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(Part {
                text: message.content.clone(),
            }),
            Role::User => contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: message.content.clone(),
                }],
            }),
            Role::Assistant => contents.push(Content {
                role: Some("model".to_string()),
                parts: vec![Part {
                    text: message.content.clone(),
                }],
            }),
        }
    }

    let stop_sequences = match &request.stop {
        None => vec![],
        Some(Stop::One(sequence)) => vec![sequence.clone()],
        Some(Stop::Many(sequences)) => sequences.clone(),
    };
    let has_config = request.temperature.is_some()
        || request.top_p.is_some()
        || request.max_tokens.is_some()
        || !stop_sequences.is_empty();

    GenerateRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: has_config.then(|| GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            stop_sequences,
        }),
    }
}

fn candidate_text(candidate: &Candidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .map(|part| part.text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn usage_from(metadata: Option<UsageMetadata>) -> Usage {
    let metadata = metadata.unwrap_or_default();
    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
    }
}

impl GoogleProvider {
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
        let endpoint = if stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, request.model
            )
        } else {
            format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, request.model
            )
        };
        let body = build_request(request);
        let response = self
            .client
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Google, e))?;

        if let Some(hook) = &self.rate_limit_hook {
            if let Some(info) = parse_rate_limit_headers(response.headers()) {
                hook(ProviderId::Google, info);
            }
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(ProviderId::Google, status.as_u16(), &text));
        }
        Ok(response)
    }

    async fn send_inner(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post(request, false).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Google, e))?;

        let (content, finish_reason) = parsed
            .candidates
            .first()
            .map(|candidate| {
                (
                    candidate_text(candidate),
                    candidate.finish_reason.as_deref().map(map_finish_reason),
                )
            })
            .unwrap_or((String::new(), None));

        Ok(ChatResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason,
            }],
            usage: usage_from(parsed.usage_metadata),
        })
    }

    async fn stream_inner(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.post(request, true).await?;
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let model = request.model.clone();
        let created = chrono::Utc::now().timestamp();

        let data = sse_data_stream(ProviderId::Google, response.bytes_stream());
        let chunks = data
            .filter_map(move |item| {
                let id = id.clone();
                let model = model.clone();
                async move {
                    let payload = match item {
                        Ok(payload) => payload,
                        Err(error) => return Some(Err(error)),
                    };
                    let event: GenerateResponse = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(error) => return Some(Err(Error::from(error))),
                    };
                    let candidate = event.candidates.first()?;
                    let text = candidate_text(candidate);
                    let finish_reason =
                        candidate.finish_reason.as_deref().map(map_finish_reason);
                    if text.is_empty() && finish_reason.is_none() {
                        return None;
                    }
                    Some(Ok(StreamChunk {
                        id,
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model,
                        choices: vec![StreamChoice {
                            index: 0,
                            delta: Delta {
                                role: None,
                                content: (!text.is_empty()).then_some(text),
                            },
                            finish_reason,
                        }],
                        usage: event.usage_metadata.map(|metadata| usage_from(Some(metadata))),
                    }))
                }
            })
            .boxed();
        Ok(chunks)
    }
}

#[async_trait::async_trait]
impl ChatProvider for GoogleProvider {
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: "be terse".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: "ping".to_string(),
                },
            ],
            temperature: Some(0.2),
            max_tokens: Some(32),
            top_p: None,
            stream: None,
            stop: None,
        }
    }

    #[test]
    fn test_build_request_roles() {
        let wire = build_request(&request());
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(wire.contents[0].role.as_deref(), Some("user"));
        assert!(wire.system_instruction.is_some());
        let config = wire.generation_config.unwrap();
        assert_eq!(config.max_output_tokens, Some(32));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("SAFETY"), "content_filter");
    }

    #[tokio::test]
    async fn test_send_translates_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "pong"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 5,
                    "candidatesTokenCount": 1,
                    "totalTokenCount": 6
                }
            })))
            .mount(&server)
            .await;

        let provider = GoogleProvider::new(reqwest::Client::new(), server.uri(), "g-key", None);
        let response = provider
            .send(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.first_content(), Some("pong"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 6);
    }

    #[tokio::test]
    async fn test_stream_translates_chunks() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"po\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"ng\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":2,\"totalTokenCount\":7}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let provider = GoogleProvider::new(reqwest::Client::new(), server.uri(), "g-key", None);
        let stream = provider
            .stream(&request(), &CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("po"));
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_upstream_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let provider = GoogleProvider::new(reqwest::Client::new(), server.uri(), "g-key", None);
        let error = provider
            .send(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.upstream_status(), Some(500));
    }
}
