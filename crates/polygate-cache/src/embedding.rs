//! Embedding generation over an OpenAI-style embeddings endpoint
//!
//! Embedding calls sit on the request path only as a cache optimization,
//! so they carry a hard timeout and a small retry budget; any failure
//! surfaces as `Error::Embedding` and the cache treats it as a miss.

use polygate_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Produce a dense vector for the canonical query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Full URL of the embeddings endpoint.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: Option<u32>,
    /// Hard cap on one embedding call.
    pub timeout: Duration,
    /// Retries on 429/5xx on top of the first attempt.
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// reqwest-backed embedder.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build embedding client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.config.model,
            input: [text],
            dimensions: self.config.dimensions,
        };
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Embedding(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("invalid embedding response: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("embedding response contained no data".to_string()))
    }
}

/// Transient embedding failures worth retrying: throttling and 5xx.
fn is_transient(error: &Error) -> bool {
    match error {
        Error::Embedding(message) => {
            message.contains("429")
                || message.contains("500")
                || message.contains("502")
                || message.contains("503")
                || message.contains("504")
                || message.contains("request failed")
        }
        _ => false,
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
            match self.embed_once(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(error) => {
                    if is_transient(&error) && attempt < self.config.max_retries {
                        tracing::debug!(
                            attempt,
                            error = %error,
                            "transient embedding failure, retrying"
                        );
                        last_error = Some(error);
                    } else {
                        return Err(error);
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Embedding("embedding retry loop exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, max_retries: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            endpoint: format!("{}/v1/embeddings", server.uri()),
            api_key: "test-key".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            timeout: Duration::from_secs(2),
            max_retries,
        }
    }

    fn embedding_body(vector: &[f32]) -> serde_json::Value {
        serde_json::json!({
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": vector}],
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 3, "total_tokens": 3}
        })
    }

    #[tokio::test]
    async fn test_embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[0.1, 0.2])))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(&server, 0)).unwrap();
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_embed_retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[1.0])))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(&server, 2)).unwrap();
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![1.0]);
    }

    #[tokio::test]
    async fn test_embed_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(&server, 1)).unwrap();
        let result = embedder.embed("hello").await;
        assert!(matches!(result, Err(Error::Embedding(_))));
    }

    #[tokio::test]
    async fn test_embed_non_transient_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(&server, 3)).unwrap();
        let result = embedder.embed("hello").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_data_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list", "data": [], "model": "m",
                "usage": {"prompt_tokens": 0, "total_tokens": 0}
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(&server, 0)).unwrap();
        assert!(embedder.embed("hello").await.is_err());
    }
}
