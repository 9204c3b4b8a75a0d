//! Model catalog: which provider serves which model, at what price
//!
//! The catalog is the routing engine's source of (provider × model)
//! candidates and the rate-limit middleware's way of attributing a
//! requested model to a provider before routing runs.

use crate::provider::{Capability, ModelPricing, ProviderId};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelPricing>,
}

fn caps(list: &[Capability]) -> BTreeSet<Capability> {
    list.iter().copied().collect()
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelPricing>) -> Self {
        Self { entries }
    }

    /// Built-in catalog covering the commonly routed models of each
    /// provider. Prices are USD per 1k tokens.
    pub fn builtin() -> Self {
        use Capability::*;
        let entry = |model: &str,
                     provider: ProviderId,
                     input: f64,
                     output: f64,
                     capabilities: &[Capability]| ModelPricing {
            model: model.to_string(),
            provider,
            input_per_1k: input,
            output_per_1k: output,
            capabilities: caps(capabilities),
        };

        Self::new(vec![
            entry(
                "gpt-4o",
                ProviderId::OpenAi,
                0.0025,
                0.01,
                &[Streaming, Tools, Vision, JsonMode, LongContext],
            ),
            entry(
                "gpt-4o-mini",
                ProviderId::OpenAi,
                0.00015,
                0.0006,
                &[Streaming, Tools, Vision, JsonMode],
            ),
            entry(
                "gpt-4.1",
                ProviderId::OpenAi,
                0.002,
                0.008,
                &[Streaming, Tools, Vision, JsonMode, LongContext],
            ),
            entry(
                "claude-sonnet-4-20250514",
                ProviderId::Anthropic,
                0.003,
                0.015,
                &[Streaming, Tools, Vision, LongContext],
            ),
            entry(
                "claude-3-5-haiku-20241022",
                ProviderId::Anthropic,
                0.0008,
                0.004,
                &[Streaming, Tools, Vision],
            ),
            entry(
                "gemini-2.0-flash",
                ProviderId::Google,
                0.0001,
                0.0004,
                &[Streaming, Tools, Vision, JsonMode, LongContext],
            ),
            entry(
                "gemini-1.5-pro",
                ProviderId::Google,
                0.00125,
                0.005,
                &[Streaming, Tools, Vision, LongContext],
            ),
        ])
    }

    pub fn entries(&self) -> &[ModelPricing] {
        &self.entries
    }

    /// All catalog entries served by one provider.
    pub fn models_for(&self, provider: ProviderId) -> Vec<&ModelPricing> {
        self.entries
            .iter()
            .filter(|e| e.provider == provider)
            .collect()
    }

    /// Exact catalog lookup by model id.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.entries.iter().find(|e| e.model == model)
    }

    /// Attribute a requested model string to a provider: exact catalog
    /// match first, falling back to well-known prefix families so that
    /// unlisted variants still rate-limit against the right bucket.
    pub fn provider_for(&self, model: &str) -> Option<ProviderId> {
        if let Some(entry) = self.get(model) {
            return Some(entry.provider);
        }
        if model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3") {
            Some(ProviderId::OpenAi)
        } else if model.starts_with("claude-") {
            Some(ProviderId::Anthropic)
        } else if model.starts_with("gemini-") {
            Some(ProviderId::Google)
        } else {
            None
        }
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
