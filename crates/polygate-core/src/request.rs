//! Per-request routing metadata and client hints

use crate::openai::ChatRequest;
use crate::provider::{Capability, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Scoring strategy requested by the client (or configured default).
/// Each variant selects an explicit weight set in the rules engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    Balanced,
    Cost,
    Latency,
    Capability,
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(RoutingStrategy::Balanced),
            "cost" => Ok(RoutingStrategy::Cost),
            "latency" => Ok(RoutingStrategy::Latency),
            "capability" => Ok(RoutingStrategy::Capability),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// Routing hints carried on `x-routing-*` request headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingHints {
    pub strategy: Option<RoutingStrategy>,
    pub prefer_provider: Option<ProviderId>,
    pub max_latency_ms: Option<u64>,
    pub max_cost_per_1k: Option<f64>,
}

/// Everything the routing engine needs to know about one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub model: String,
    pub estimated_input_tokens: u32,
    pub max_output_tokens: Option<u32>,
    pub stream: bool,
    pub required_capabilities: BTreeSet<Capability>,
    pub hints: RoutingHints,
}

impl RequestMetadata {
    /// Derive metadata from a validated wire request. Streaming requests
    /// require the streaming capability; everything else is hint-driven.
    pub fn from_request(request: &ChatRequest, hints: RoutingHints) -> Self {
        let mut required_capabilities = BTreeSet::new();
        if request.is_streaming() {
            required_capabilities.insert(Capability::Streaming);
        }
        Self {
            model: request.model.clone(),
            estimated_input_tokens: request.estimated_input_tokens(),
            max_output_tokens: request.max_tokens,
            stream: request.is_streaming(),
            required_capabilities,
            hints,
        }
    }
}
