//! Upstream provider adapters
//!
//! One adapter per provider, each implementing `ChatProvider` from the
//! core crate: non-streaming calls buffer the full completion, streaming
//! calls decode the provider's SSE dialect into OpenAI-shape chunks. A
//! shared reqwest client handles pooling; rate-limit headers harvested
//! from responses are pushed through a hook so the registry sees
//! provider-side quota.

pub mod anthropic;
pub mod client;
pub mod dispatch;
pub mod google;
pub mod openai;
pub mod retry_after;
pub mod sse;

pub use client::{create_client, HttpClientConfig};
pub use dispatch::{ProviderDispatcher, ProviderEndpoint};
pub use retry_after::{parse_rate_limit_headers, parse_retry_after, RateLimitHook, RateLimitInfo};
