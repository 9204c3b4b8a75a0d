//! Routing rules: conditions, candidate building, scoring, ranking
//!
//! The engine turns a registry snapshot plus request metadata into a ranked
//! list of (provider × model) candidates:
//!
//! 1. keep providers that are available and not provider-side rate limited,
//! 2. build candidates from the model catalog, filtered by required
//!    capabilities (streaming requests require the streaming capability),
//! 3. evaluate every rule against every candidate,
//! 4. drop candidates excluded by a matched, relevant rule,
//! 5. score with the strategy's weight set plus preference boosts,
//! 6. sort by score descending, ties broken by latency EMA ascending.

use crate::registry::ProviderState;
use polygate_core::{
    Capability, ModelCatalog, ModelPricing, ProviderId, RequestMetadata, RoutingStrategy,
};
use serde::{Deserialize, Serialize};

/// A single rule condition, evaluated as a pure predicate per candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleCondition {
    /// Provider serves at least one model with avg(input, output)/1k at or
    /// under the threshold.
    Cost { max_per_1k: f64 },
    /// Provider's observed p95 is at or under the threshold. Unknown
    /// latency fails the rule.
    Latency { max_ms: u64 },
    /// The candidate model covers every required capability.
    Capability { required: Vec<Capability> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    /// Higher priority rules contribute larger preference boosts.
    #[serde(default)]
    pub priority: i32,
    pub condition: RuleCondition,
    #[serde(default)]
    pub preferred_providers: Vec<ProviderId>,
    #[serde(default)]
    pub excluded_providers: Vec<ProviderId>,
}

/// Everything a condition may look at for one candidate.
pub struct CandidateContext<'a> {
    pub candidate: &'a ModelPricing,
    /// All catalog models served by the candidate's provider.
    pub provider_models: Vec<&'a ModelPricing>,
    /// Observed p95 for the provider; `None` when no samples exist.
    pub latency_p95_ms: Option<u64>,
}

/// Pure dispatch over the condition variant.
pub fn evaluate(condition: &RuleCondition, ctx: &CandidateContext<'_>) -> bool {
    match condition {
        RuleCondition::Cost { max_per_1k } => ctx
            .provider_models
            .iter()
            .any(|model| model.avg_per_1k() <= *max_per_1k),
        RuleCondition::Latency { max_ms } => {
            // Fail conservative when latency is unknown.
            ctx.latency_p95_ms.is_some_and(|p95| p95 <= *max_ms)
        }
        RuleCondition::Capability { required } => required
            .iter()
            .all(|capability| ctx.candidate.capabilities.contains(capability)),
    }
}

/// A scored candidate, highest score routed first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedProvider {
    pub provider: ProviderId,
    pub model: String,
    pub score: f64,
    pub matched_rules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RulesEngineConfig {
    /// Latency assumed for providers with no samples yet.
    pub default_latency_ms: f64,
    /// Strategy used when the request carries no hint.
    pub default_strategy: RoutingStrategy,
}

impl Default for RulesEngineConfig {
    fn default() -> Self {
        Self {
            default_latency_ms: 500.0,
            default_strategy: RoutingStrategy::Balanced,
        }
    }
}

/// Per-strategy weight sets. Latency dominates the balanced formula
/// because it drives perceived quality for interactive calls; the focused
/// strategies shift 0.6 of the weight onto their axis.
struct ScoreWeights {
    cost: f64,
    latency: f64,
    capability: f64,
}

impl ScoreWeights {
    fn for_strategy(strategy: RoutingStrategy) -> Self {
        match strategy {
            RoutingStrategy::Balanced => ScoreWeights {
                cost: 0.3,
                latency: 0.4,
                capability: 0.3,
            },
            RoutingStrategy::Cost => ScoreWeights {
                cost: 0.6,
                latency: 0.2,
                capability: 0.2,
            },
            RoutingStrategy::Latency => ScoreWeights {
                cost: 0.2,
                latency: 0.6,
                capability: 0.2,
            },
            RoutingStrategy::Capability => ScoreWeights {
                cost: 0.2,
                latency: 0.2,
                capability: 0.6,
            },
        }
    }
}

/// Boost added per matched preferring rule: priority * this factor.
const PREFERENCE_BOOST_FACTOR: f64 = 0.05;
/// Boost for the client's `x-routing-prefer-provider` hint, equivalent to
/// a priority-1 preference rule.
const HINT_PREFERENCE_BOOST: f64 = 0.05;

pub struct RulesEngine {
    rules: Vec<RoutingRule>,
    catalog: ModelCatalog,
    config: RulesEngineConfig,
}

struct ScoringRow {
    provider: ProviderId,
    model: String,
    cost_metric: f64,
    latency_metric: f64,
    capability_score: f64,
    boost: f64,
    matched_rules: Vec<String>,
}

impl RulesEngine {
    pub fn new(
        mut rules: Vec<RoutingRule>,
        catalog: ModelCatalog,
        config: RulesEngineConfig,
    ) -> Self {
        // Highest priority first; evaluation order is observable through
        // matched_rules.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            catalog,
            config,
        }
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    fn rule_is_relevant(rule: &RoutingRule, meta: &RequestMetadata) -> bool {
        let strategy = meta.hints.strategy;
        match rule.condition {
            RuleCondition::Cost { .. } => {
                meta.hints.max_cost_per_1k.is_some() || strategy == Some(RoutingStrategy::Cost)
            }
            RuleCondition::Latency { .. } => {
                meta.hints.max_latency_ms.is_some() || strategy == Some(RoutingStrategy::Latency)
            }
            RuleCondition::Capability { .. } => true,
        }
    }

    /// Rank all eligible (provider × model) candidates for this request.
    pub fn rank(&self, states: &[ProviderState], meta: &RequestMetadata) -> Vec<RankedProvider> {
        let now = chrono::Utc::now();

        // 1. Eligible providers: available, and either quota remains or the
        //    provider-reported reset has passed.
        let eligible: Vec<&ProviderState> = states
            .iter()
            .filter(|state| {
                if !state.available {
                    return false;
                }
                match state.rate_limit_remaining {
                    None | Some(1..) => true,
                    Some(0) => state
                        .rate_limit_reset_at
                        .is_some_and(|reset_at| reset_at < now),
                }
            })
            .collect();

        // 2. Candidates from the catalog, capability-filtered.
        let mut rows: Vec<ScoringRow> = Vec::new();
        for state in &eligible {
            let provider_models = self.catalog.models_for(state.provider);
            for candidate in provider_models.iter().copied() {
                let satisfies = meta
                    .required_capabilities
                    .iter()
                    .all(|capability| candidate.capabilities.contains(capability));
                if !satisfies {
                    continue;
                }
                if meta.stream && !candidate.capabilities.contains(&Capability::Streaming) {
                    continue;
                }

                let ctx = CandidateContext {
                    candidate,
                    provider_models: provider_models.clone(),
                    latency_p95_ms: (state.latency.samples > 0).then_some(state.latency.p95_ms),
                };

                // 3. Evaluate every rule; 4. apply relevant exclusions.
                let mut matched_rules = Vec::new();
                let mut excluded = false;
                let mut boost = 0.0;
                for rule in &self.rules {
                    if !evaluate(&rule.condition, &ctx) {
                        continue;
                    }
                    matched_rules.push(rule.id.clone());
                    if Self::rule_is_relevant(rule, meta)
                        && rule.excluded_providers.contains(&state.provider)
                    {
                        excluded = true;
                        break;
                    }
                    if rule.preferred_providers.contains(&state.provider) {
                        boost += rule.priority as f64 * PREFERENCE_BOOST_FACTOR;
                    }
                }
                if excluded {
                    tracing::debug!(
                        provider = %state.provider,
                        model = %candidate.model,
                        "candidate dropped by exclusion rule"
                    );
                    continue;
                }

                if meta.hints.prefer_provider == Some(state.provider) {
                    boost += HINT_PREFERENCE_BOOST;
                }

                let capability_score = if meta.required_capabilities.is_empty() {
                    (candidate.capabilities.len() as f64 / 5.0).min(1.0)
                } else {
                    let matched = meta
                        .required_capabilities
                        .iter()
                        .filter(|capability| candidate.capabilities.contains(capability))
                        .count();
                    matched as f64 / meta.required_capabilities.len() as f64
                };

                let ema_known = state.latency.samples > 0;
                rows.push(ScoringRow {
                    provider: state.provider,
                    model: candidate.model.clone(),
                    cost_metric: candidate.avg_per_1k(),
                    latency_metric: if ema_known {
                        state.latency.ema_ms
                    } else {
                        self.config.default_latency_ms
                    },
                    capability_score,
                    boost,
                    matched_rules,
                });
            }
        }

        if rows.is_empty() {
            return Vec::new();
        }

        // 5. Normalize metrics over the candidate set and score.
        let weights = ScoreWeights::for_strategy(
            meta.hints.strategy.unwrap_or(self.config.default_strategy),
        );
        let normalize = |value: f64, min: f64, max: f64| {
            if (max - min).abs() < f64::EPSILON {
                // A tie normalizes to the best value.
                0.0
            } else {
                (value - min) / (max - min)
            }
        };
        let (cost_min, cost_max) = min_max(rows.iter().map(|r| r.cost_metric));
        let (lat_min, lat_max) = min_max(rows.iter().map(|r| r.latency_metric));

        let mut ranked: Vec<RankedProvider> = Vec::with_capacity(rows.len());
        let mut emas: Vec<f64> = Vec::with_capacity(rows.len());
        for row in rows {
            let cost_score = 1.0 - normalize(row.cost_metric, cost_min, cost_max);
            let latency_score = 1.0 - normalize(row.latency_metric, lat_min, lat_max);
            let score = weights.cost * cost_score
                + weights.latency * latency_score
                + weights.capability * row.capability_score
                + row.boost;
            emas.push(row.latency_metric);
            ranked.push(RankedProvider {
                provider: row.provider,
                model: row.model,
                score,
                matched_rules: row.matched_rules,
            });
        }

        // 6. Score descending; equal scores ordered by EMA ascending so a
        //    faster-observed provider wins the tie deterministically.
        let mut order: Vec<usize> = (0..ranked.len()).collect();
        order.sort_by(|&a, &b| {
            ranked[b]
                .score
                .partial_cmp(&ranked[a].score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    emas[a]
                        .partial_cmp(&emas[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| ranked[a].model.cmp(&ranked[b].model))
        });
        order.into_iter().map(|i| ranked[i].clone()).collect()
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        min = min.min(value);
        max = max.max(value);
    }
    (min, max)
}
