//! Cache orchestration: canonicalization, tag hygiene, lookup, storage

use crate::embedding::Embedder;
use crate::store::{CachedResponse, VectorStore};
use once_cell::sync::Lazy;
use polygate_core::{ChatMessage, ChatRequest, ChatResponse, Error, Result, Role};
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Allowed characters for a cache model tag. Anything outside this set is
/// refused before it can reach the vector index's tag syntax.
static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:/-]{1,128}$").expect("tag pattern is valid"));

/// Characters with meaning in vector-index tag syntax, escaped on the way
/// in as defense in depth behind `validate_model_tag`.
const TAG_SPECIALS: &[char] = &[
    ',', '.', '<', '>', '{', '}', '[', ']', '"', '\'', ':', ';', '!', '@', '#', '$', '%', '^',
    '&', '*', '(', ')', '-', '+', '=', '~', '|', '/', ' ', '\\',
];

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    /// Maximum cosine distance for a hit (lower = more similar).
    pub distance_threshold: f32,
    /// Canonical text is truncated to this many characters before
    /// embedding, bounding embedding API cost.
    pub max_canonical_chars: usize,
    /// Neighbors fetched per lookup; post-filters need more than one.
    pub knn_k: usize,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            distance_threshold: 0.15,
            max_canonical_chars: 32_000,
            knn_k: 5,
        }
    }
}

/// Result of a cache lookup. Lookup never fails the request.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Hit { response: ChatResponse, distance: f32 },
    Miss,
}

/// Canonical text for a conversation: `role: content` per message, joined
/// by newlines, truncated to `max_chars`.
pub fn canonicalize(messages: &[ChatMessage], max_chars: usize) -> String {
    let mut canonical = String::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            canonical.push('\n');
        }
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        canonical.push_str(role);
        canonical.push_str(": ");
        canonical.push_str(&message.content);
        if canonical.chars().count() >= max_chars {
            break;
        }
    }
    if canonical.chars().count() > max_chars {
        canonical.chars().take(max_chars).collect()
    } else {
        canonical
    }
}

/// Refuse model strings that could smuggle tag syntax into the index.
pub fn validate_model_tag(model: &str) -> Result<()> {
    if TAG_PATTERN.is_match(model) {
        Ok(())
    } else {
        Err(Error::Cache(format!(
            "model contains characters not allowed in cache tags: {model:?}"
        )))
    }
}

/// Escape every tag-syntax special with a backslash.
pub fn escape_tag(model: &str) -> String {
    let mut escaped = String::with_capacity(model.len());
    for c in model.chars() {
        if TAG_SPECIALS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct SemanticCache {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: SemanticCacheConfig,
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: SemanticCacheConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a semantically similar cached response for this request.
    /// Any failure along the way degrades to `Miss` with a warning.
    pub async fn lookup(&self, request: &ChatRequest) -> CacheOutcome {
        if !self.config.enabled {
            return CacheOutcome::Miss;
        }
        if let Err(error) = validate_model_tag(&request.model) {
            tracing::warn!(model = %request.model, error = %error, "cache lookup skipped");
            return CacheOutcome::Miss;
        }

        let canonical = canonicalize(&request.messages, self.config.max_canonical_chars);
        let embedding = match self.embedder.embed(&canonical).await {
            Ok(embedding) => embedding,
            Err(error) => {
                tracing::warn!(error = %error, "embedding failed, treating as cache miss");
                return CacheOutcome::Miss;
            }
        };

        let tag = escape_tag(&request.model);
        let neighbors = match self
            .store
            .search(&embedding, self.config.knn_k.max(5), &tag)
            .await
        {
            Ok(neighbors) => neighbors,
            Err(error) => {
                tracing::warn!(error = %error, "vector search failed, treating as cache miss");
                return CacheOutcome::Miss;
            }
        };

        // Post-filter: similarity threshold plus exact sampling-parameter
        // match, so a low-temperature request never reuses a creative
        // completion.
        for neighbor in neighbors {
            if neighbor.distance > self.config.distance_threshold {
                continue;
            }
            if neighbor.document.temperature != request.temperature {
                continue;
            }
            if neighbor.document.max_tokens != request.max_tokens {
                continue;
            }
            tracing::debug!(
                key = %neighbor.key,
                distance = neighbor.distance,
                "semantic cache hit"
            );
            return CacheOutcome::Hit {
                response: neighbor.document.response,
                distance: neighbor.distance,
            };
        }
        CacheOutcome::Miss
    }

    /// Store a successful non-streaming response. TTL gets ±10% jitter so
    /// a burst of identical requests does not expire in lockstep.
    pub async fn store(&self, request: &ChatRequest, response: &ChatResponse) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        validate_model_tag(&request.model)?;

        let canonical = canonicalize(&request.messages, self.config.max_canonical_chars);
        let embedding = self.embedder.embed(&canonical).await?;

        let document = CachedResponse {
            query_text: canonical,
            model: request.model.clone(),
            response: response.clone(),
            usage: response.usage,
            embedding,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            created_at: chrono::Utc::now().timestamp(),
        };

        let key = format!(
            "cache:{}-{}",
            chrono::Utc::now().timestamp(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let ttl = self.config.ttl.mul_f64(jitter);
        self.store
            .insert(&key, &escape_tag(&request.model), document, ttl)
            .await
    }
}
