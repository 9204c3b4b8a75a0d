//! Semantic response cache
//!
//! Embedding-based lookup: canonicalize the conversation, embed it, run a
//! KNN search scoped to the requested model, and post-filter by cosine
//! distance and sampling parameters. Cache failures never fail a request;
//! they degrade to a miss with a warning.

pub mod cache;
pub mod embedding;
pub mod store;

pub use cache::{
    canonicalize, escape_tag, validate_model_tag, CacheOutcome, SemanticCache,
    SemanticCacheConfig,
};
pub use embedding::{Embedder, EmbeddingConfig, HttpEmbedder};
pub use store::{cosine_distance, CachedResponse, InMemoryVectorStore, ScoredDocument, VectorStore};
