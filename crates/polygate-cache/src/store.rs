//! Vector store seam and the in-process implementation
//!
//! The production deployment points this trait at an external vector index
//! (HNSW + cosine distance). The in-memory store below is a brute-force
//! cosine scan with the same semantics, used by tests and single-node
//! setups.

use polygate_core::{ChatResponse, Error, Result, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One cached completion, serialized into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Canonical query text the embedding was computed from.
    pub query_text: String,
    pub model: String,
    pub response: ChatResponse,
    pub usage: Usage,
    pub embedding: Vec<f32>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub created_at: i64,
}

/// A KNN search result with its cosine distance (lower = more similar).
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub key: String,
    pub distance: f32,
    pub document: CachedResponse,
}

/// `1 - cos(theta)`: 0 for identical direction, 1 for orthogonal.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// K nearest neighbors among documents carrying `tag`, ordered by
    /// ascending distance. The tag is already validated and escaped by the
    /// cache layer.
    async fn search(&self, embedding: &[f32], k: usize, tag: &str)
        -> Result<Vec<ScoredDocument>>;

    /// Insert a document under `key` with the given TTL.
    async fn insert(
        &self,
        key: &str,
        tag: &str,
        document: CachedResponse,
        ttl: Duration,
    ) -> Result<()>;
}

struct StoredEntry {
    tag: String,
    document: CachedResponse,
    expires_at: Instant,
}

/// Brute-force cosine store with TTL expiry on read.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) documents.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        tag: &str,
    ) -> Result<Vec<ScoredDocument>> {
        let now = Instant::now();
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Cache("vector store lock poisoned".to_string()))?;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now && entry.tag == tag)
            .map(|(key, entry)| ScoredDocument {
                key: key.clone(),
                distance: cosine_distance(embedding, &entry.document.embedding),
                document: entry.document.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn insert(
        &self,
        key: &str,
        tag: &str,
        document: CachedResponse,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Cache("vector store lock poisoned".to_string()))?;
        // Opportunistic cleanup so expired entries do not accumulate.
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            StoredEntry {
                tag: tag.to_string(),
                document,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polygate_core::{ChatMessage, Choice, Role};

    fn response(content: &str) -> ChatResponse {
        ChatResponse {
            id: "chatcmpl-test".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: content.to_string(),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage::default(),
        }
    }

    fn document(model: &str, embedding: Vec<f32>) -> CachedResponse {
        CachedResponse {
            query_text: "user: hi".to_string(),
            model: model.to_string(),
            response: response("hello"),
            usage: Usage::default(),
            embedding,
            temperature: Some(0.7),
            max_tokens: None,
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_cosine_distance_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_mismatched_lengths() {
        assert_eq!(cosine_distance(&[1.0], &[1.0, 2.0]), 1.0);
        assert_eq!(cosine_distance(&[], &[]), 1.0);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
    }

    #[tokio::test]
    async fn test_insert_and_search() {
        let store = InMemoryVectorStore::new();
        store
            .insert(
                "cache:1-aaaa",
                "gpt-4o",
                document("gpt-4o", vec![1.0, 0.0]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 5, "gpt-4o").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].distance < 1e-6);
    }

    #[tokio::test]
    async fn test_search_is_tag_scoped() {
        let store = InMemoryVectorStore::new();
        store
            .insert(
                "cache:1-aaaa",
                "gpt-4o",
                document("gpt-4o", vec![1.0, 0.0]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 5, "gpt-4o-mini").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_orders_by_distance_and_truncates() {
        let store = InMemoryVectorStore::new();
        store
            .insert(
                "near",
                "m",
                document("m", vec![1.0, 0.05]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store
            .insert(
                "far",
                "m",
                document("m", vec![0.2, 1.0]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store
            .insert(
                "exact",
                "m",
                document("m", vec![1.0, 0.0]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 2, "m").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key, "exact");
        assert_eq!(results[1].key, "near");
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let store = InMemoryVectorStore::new();
        store
            .insert(
                "cache:1-aaaa",
                "m",
                document("m", vec![1.0]),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let results = store.search(&[1.0], 5, "m").await.unwrap();
        assert!(results.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_cached_response_round_trip() {
        let doc = document("gpt-4o", vec![0.5, 0.25]);
        let json = serde_json::to_string(&doc).unwrap();
        let back: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, "gpt-4o");
        assert_eq!(back.embedding, vec![0.5, 0.25]);
        assert_eq!(back.temperature, Some(0.7));
        assert_eq!(back.response.first_content(), Some("hello"));
    }
}
