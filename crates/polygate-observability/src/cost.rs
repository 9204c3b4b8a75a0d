//! Cost tracking from reported token usage × catalog pricing

use crate::counter::RequestCounter;
use crate::ring::RingBuffer;
use chrono::Utc;
use polygate_core::{ModelCatalog, ProviderId, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One priced request, kept in the recent-history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: ProviderId,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub at_unix: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProviderCosts {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

/// Deep-copied snapshot served at `/metrics/costs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub total_requests: u64,
    pub total_cost_usd: f64,
    pub by_provider: HashMap<ProviderId, ProviderCosts>,
    pub recent: Vec<CostRecord>,
}

struct CostState {
    by_provider: HashMap<ProviderId, ProviderCosts>,
    recent: RingBuffer<CostRecord>,
    total_cost_usd: f64,
}

pub struct CostTracker {
    catalog: ModelCatalog,
    counter: Arc<RequestCounter>,
    state: Mutex<CostState>,
}

impl CostTracker {
    pub fn new(catalog: ModelCatalog, counter: Arc<RequestCounter>, recent_capacity: usize) -> Self {
        Self {
            catalog,
            counter,
            state: Mutex::new(CostState {
                by_provider: HashMap::new(),
                recent: RingBuffer::new(recent_capacity),
                total_cost_usd: 0.0,
            }),
        }
    }

    /// Price one completed request from its reported usage. Models missing
    /// from the catalog record tokens with zero cost.
    pub fn record(&self, provider: ProviderId, model: &str, usage: &Usage) {
        let cost_usd = self
            .catalog
            .get(model)
            .map(|pricing| {
                (usage.prompt_tokens as f64 / 1000.0) * pricing.input_per_1k
                    + (usage.completion_tokens as f64 / 1000.0) * pricing.output_per_1k
            })
            .unwrap_or(0.0);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state.by_provider.entry(provider).or_default();
        entry.requests += 1;
        entry.prompt_tokens += usage.prompt_tokens as u64;
        entry.completion_tokens += usage.completion_tokens as u64;
        entry.cost_usd += cost_usd;
        state.total_cost_usd += cost_usd;
        state.recent.push(CostRecord {
            provider,
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd,
            at_unix: Utc::now().timestamp(),
        });
    }

    pub fn snapshot(&self) -> CostSnapshot {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        CostSnapshot {
            total_requests: self.counter.total(),
            total_cost_usd: state.total_cost_usd,
            by_provider: state.by_provider.clone(),
            recent: state.recent.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CostTracker {
        CostTracker::new(ModelCatalog::builtin(), Arc::new(RequestCounter::new()), 8)
    }

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn test_records_priced_usage() {
        let tracker = tracker();
        // gpt-4o: 0.0025 in / 0.01 out per 1k
        tracker.record(ProviderId::OpenAi, "gpt-4o", &usage(1000, 500));
        let snapshot = tracker.snapshot();
        let openai = snapshot.by_provider.get(&ProviderId::OpenAi).unwrap();
        assert_eq!(openai.requests, 1);
        assert_eq!(openai.prompt_tokens, 1000);
        assert!((openai.cost_usd - 0.0075).abs() < 1e-9);
        assert!((snapshot.total_cost_usd - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_records_zero_cost() {
        let tracker = tracker();
        tracker.record(ProviderId::OpenAi, "gpt-unknown", &usage(100, 100));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_cost_usd, 0.0);
        assert_eq!(
            snapshot
                .by_provider
                .get(&ProviderId::OpenAi)
                .unwrap()
                .prompt_tokens,
            100
        );
    }

    #[test]
    fn test_recent_history_is_bounded() {
        let tracker = tracker();
        for _ in 0..20 {
            tracker.record(ProviderId::Google, "gemini-2.0-flash", &usage(10, 10));
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.recent.len(), 8);
    }

    #[test]
    fn test_snapshot_reads_shared_counter() {
        let counter = Arc::new(RequestCounter::new());
        let tracker = CostTracker::new(ModelCatalog::builtin(), Arc::clone(&counter), 8);
        counter.increment();
        counter.increment();
        assert_eq!(tracker.snapshot().total_requests, 2);
    }
}
