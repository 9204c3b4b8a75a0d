//! Provider identity, capabilities, and the upstream chat seam

use crate::error::Result;
use crate::openai::{ChatRequest, ChatResponse, StreamChunk};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// The closed set of upstream providers the gateway can route to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "google" => Ok(ProviderId::Google),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Model capabilities used for candidate filtering and capability rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Streaming,
    Tools,
    Vision,
    JsonMode,
    LongContext,
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Capability::Streaming),
            "tools" => Ok(Capability::Tools),
            "vision" => Ok(Capability::Vision),
            "json-mode" => Ok(Capability::JsonMode),
            "long-context" => Ok(Capability::LongContext),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// One catalog entry: a model served by a provider, with pricing per 1k
/// tokens and the capabilities it advertises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: ProviderId,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub capabilities: BTreeSet<Capability>,
}

impl ModelPricing {
    /// Average of input and output cost, the metric cost rules compare
    /// against.
    pub fn avg_per_1k(&self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

/// A live stream of completion chunks from an upstream provider.
pub type ChatStream = BoxStream<'static, Result<StreamChunk>>;

/// The seam between the gateway and one upstream provider's chat API.
///
/// Implementations must honor the cancellation token: when it fires, any
/// in-flight HTTP call is abandoned and streams terminate promptly.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a non-streaming request and buffer the full response.
    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken)
        -> Result<ChatResponse>;

    /// Open a streaming request.
    async fn stream(&self, request: &ChatRequest, cancel: &CancellationToken)
        -> Result<ChatStream>;
}
