//! Routing and resiliency engine for the polygate gateway
//!
//! Leaves-first: the token bucket and latency tracker know nothing of
//! providers' health; the registry owns circuit-breaker state and feeds the
//! tracker; the rules engine ranks (provider × model) candidates from
//! registry snapshots; the selector orchestrates ranking, half-open probe
//! claims, and the fallback handler.

pub mod fallback;
pub mod latency;
pub mod registry;
pub mod retry;
pub mod rules;
pub mod selector;
pub mod token_bucket;

pub use fallback::{run_with_fallback, FallbackOptions, FallbackOutcome};
pub use latency::{LatencyStats, LatencyTracker, LatencyTrackerConfig};
pub use registry::{CircuitState, ProviderRegistry, ProviderState, RegistryConfig};
pub use rules::{RankedProvider, RoutingRule, RuleCondition, RulesEngine, RulesEngineConfig};
pub use selector::{ModelSelector, SelectedRoute};
pub use token_bucket::TokenBucket;
