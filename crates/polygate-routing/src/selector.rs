//! Model selector: orchestrates registry snapshots, ranking, half-open
//! probe claims, and the fallback handler
//!
//! Selection and execution are split so the routing middleware can rank
//! once, stash the result on the request, and let the terminal handler
//! drive the fallback chain with the same route.

use crate::fallback::{self, FallbackOptions, FallbackOutcome};
use crate::registry::{CircuitState, ProviderRegistry};
use crate::rules::{RankedProvider, RulesEngine};
use polygate_core::{Error, ProviderId, RequestMetadata, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A ranked route plus the half-open probes this selection claimed.
/// Claimed-but-unattempted probes are released when the route resolves so
/// an unused claim cannot wedge a provider in half-open.
#[derive(Debug, Clone)]
pub struct SelectedRoute {
    pub ranked: Vec<RankedProvider>,
    pub claimed_probes: Vec<ProviderId>,
}

impl SelectedRoute {
    /// The top-ranked candidate.
    pub fn primary(&self) -> &RankedProvider {
        &self.ranked[0]
    }
}

pub struct ModelSelector {
    registry: Arc<ProviderRegistry>,
    engine: RulesEngine,
    options: FallbackOptions,
}

impl ModelSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        engine: RulesEngine,
        options: FallbackOptions,
    ) -> Self {
        Self {
            registry,
            engine,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &RulesEngine {
        &self.engine
    }

    /// Snapshot, rank, and claim half-open probes. Fails with
    /// `NoProviderAvailable` when nothing survives.
    pub fn select(&self, meta: &RequestMetadata) -> Result<SelectedRoute> {
        let states = self.registry.provider_states();
        let ranked = self.engine.rank(&states, meta);
        if ranked.is_empty() {
            tracing::warn!(model = %meta.model, "no provider available after ranking");
            return Err(Error::NoProviderAvailable);
        }

        // Half-open providers admit exactly one probe: keep their
        // candidates only if this request wins the claim.
        let mut claimed_probes = Vec::new();
        let mut lost_claim: HashSet<ProviderId> = HashSet::new();
        let mut selected = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            match self.registry.circuit_state(candidate.provider) {
                Some(CircuitState::HalfOpen) => {
                    if claimed_probes.contains(&candidate.provider) {
                        selected.push(candidate);
                    } else if lost_claim.contains(&candidate.provider) {
                        // Another request holds the probe.
                    } else if self.registry.try_claim_probe(candidate.provider) {
                        claimed_probes.push(candidate.provider);
                        selected.push(candidate);
                    } else {
                        lost_claim.insert(candidate.provider);
                    }
                }
                Some(CircuitState::Closed) => selected.push(candidate),
                // Open circuits and unknown providers never route. Open
                // ones normally fail the availability filter already; this
                // guards the race where a circuit opens mid-selection.
                Some(CircuitState::Open) | None => {}
            }
        }

        if selected.is_empty() {
            for provider in claimed_probes {
                self.registry.release_probe(provider);
            }
            return Err(Error::NoProviderAvailable);
        }

        tracing::debug!(
            model = %meta.model,
            primary = %selected[0].provider,
            candidates = selected.len(),
            "route selected"
        );
        Ok(SelectedRoute {
            ranked: selected,
            claimed_probes,
        })
    }

    /// Drive an already-selected route through the fallback handler. The
    /// execute callback is wrapped with registry reporting so breaker state
    /// advances on every attempt.
    pub async fn execute_route<T, F, Fut>(
        &self,
        route: &SelectedRoute,
        deadline: &CancellationToken,
        streaming: bool,
        execute: F,
    ) -> Result<FallbackOutcome<T>>
    where
        F: Fn(ProviderId, String, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut options = self.options.clone();
        options.streaming = streaming;

        let registry = Arc::clone(&self.registry);
        let result = fallback::run_with_fallback(
            &route.ranked,
            deadline,
            &options,
            |provider, model, token| {
                let registry = Arc::clone(&registry);
                let fut = execute(provider, model.clone(), token);
                async move {
                    let started = Instant::now();
                    match fut.await {
                        Ok(value) => {
                            registry.report_success(
                                provider,
                                &model,
                                started.elapsed().as_millis() as u64,
                            );
                            Ok(value)
                        }
                        Err(error) => {
                            // A deadline cancellation is the gateway's
                            // doing, not the provider's failure.
                            if !matches!(error, Error::Cancelled) {
                                registry.report_error(provider, &model, &error);
                            }
                            Err(error)
                        }
                    }
                }
            },
        )
        .await;

        // Release any claimed probe the chain never reached.
        let attempted: HashSet<ProviderId> = match &result {
            Ok(outcome) => outcome.attempts.iter().map(|a| a.provider).collect(),
            Err(Error::DeadlineExceeded { attempts })
            | Err(Error::AllProvidersFailed { attempts }) => {
                attempts.iter().map(|a| a.provider).collect()
            }
            Err(_) => HashSet::new(),
        };
        for provider in &route.claimed_probes {
            if !attempted.contains(provider) {
                self.registry.release_probe(*provider);
            }
        }

        result
    }

    /// Rank and execute in one call (spec §4.7 `selectWithFallback`).
    pub async fn select_with_fallback<T, F, Fut>(
        &self,
        meta: &RequestMetadata,
        deadline: &CancellationToken,
        execute: F,
    ) -> Result<FallbackOutcome<T>>
    where
        F: Fn(ProviderId, String, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let route = self.select(meta)?;
        self.execute_route(&route, deadline, meta.stream, execute)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::{LatencyTracker, LatencyTrackerConfig};
    use crate::registry::RegistryConfig;
    use crate::rules::RulesEngineConfig;
    use polygate_core::{ModelCatalog, RequestMetadata, RoutingHints};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn upstream_error(provider: ProviderId) -> Error {
        Error::Upstream {
            provider,
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    fn selector_with(providers: Vec<ProviderId>, cooldown_ms: u64) -> ModelSelector {
        let tracker = Arc::new(LatencyTracker::new(LatencyTrackerConfig::default()));
        let registry = Arc::new(ProviderRegistry::new(
            providers,
            RegistryConfig {
                error_threshold: 5,
                cooldown: Duration::from_millis(cooldown_ms),
            },
            tracker,
        ));
        let engine = RulesEngine::new(vec![], ModelCatalog::builtin(), RulesEngineConfig::default());
        ModelSelector::new(
            registry,
            engine,
            FallbackOptions {
                max_retries: 1,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                streaming: false,
            },
        )
    }

    fn meta() -> RequestMetadata {
        RequestMetadata {
            model: "gpt-4o".to_string(),
            estimated_input_tokens: 10,
            max_output_tokens: None,
            stream: false,
            required_capabilities: BTreeSet::new(),
            hints: RoutingHints::default(),
        }
    }

    #[test]
    fn test_select_empty_registry_fails() {
        let selector = selector_with(vec![], 30_000);
        assert!(matches!(
            selector.select(&meta()),
            Err(Error::NoProviderAvailable)
        ));
    }

    #[test]
    fn test_select_all_circuits_open_fails() {
        let selector = selector_with(vec![ProviderId::OpenAi], 30_000);
        for _ in 0..5 {
            selector
                .registry()
                .report_error(ProviderId::OpenAi, "gpt-4o", &upstream_error(ProviderId::OpenAi));
        }
        assert!(matches!(
            selector.select(&meta()),
            Err(Error::NoProviderAvailable)
        ));
    }

    #[test]
    fn test_select_returns_ranked_candidates() {
        let selector = selector_with(vec![ProviderId::OpenAi, ProviderId::Google], 30_000);
        let route = selector.select(&meta()).unwrap();
        assert!(!route.ranked.is_empty());
        assert!(route.claimed_probes.is_empty());
        // Candidates from both providers survive.
        let providers: HashSet<ProviderId> =
            route.ranked.iter().map(|r| r.provider).collect();
        assert!(providers.contains(&ProviderId::OpenAi));
        assert!(providers.contains(&ProviderId::Google));
    }

    #[test]
    fn test_select_claims_half_open_probe_once() {
        let selector = selector_with(vec![ProviderId::OpenAi], 10);
        for _ in 0..5 {
            selector
                .registry()
                .report_error(ProviderId::OpenAi, "gpt-4o", &upstream_error(ProviderId::OpenAi));
        }
        std::thread::sleep(Duration::from_millis(20));

        let route = selector.select(&meta()).unwrap();
        assert_eq!(route.claimed_probes, vec![ProviderId::OpenAi]);
        // A concurrent selection loses the probe and has nothing left.
        assert!(matches!(
            selector.select(&meta()),
            Err(Error::NoProviderAvailable)
        ));
    }

    #[tokio::test]
    async fn test_execute_route_reports_success() {
        let selector = selector_with(vec![ProviderId::OpenAi], 30_000);
        let route = selector.select(&meta()).unwrap();
        let deadline = CancellationToken::new();

        let outcome = selector
            .execute_route(&route, &deadline, false, |_, _, _| async { Ok(7u32) })
            .await
            .unwrap();

        assert_eq!(outcome.value, 7);
        let stats = selector.registry().tracker().stats(outcome.provider);
        assert_eq!(stats.samples, 1);
    }

    #[tokio::test]
    async fn test_execute_route_reports_errors_and_opens_circuit() {
        let selector = selector_with(vec![ProviderId::OpenAi], 30_000);
        let deadline = CancellationToken::new();

        // 5 errors at max_retries=1 (2 attempts per request) arrive within
        // three requests.
        for _ in 0..3 {
            let Ok(route) = selector.select(&meta()) else {
                break;
            };
            let _ = selector
                .execute_route::<(), _, _>(&route, &deadline, false, |provider, _, _| async move {
                    Err(upstream_error(provider))
                })
                .await;
        }

        assert!(!selector.registry().is_available(ProviderId::OpenAi));
    }

    #[tokio::test]
    async fn test_failed_probe_releases_nothing_and_reopens() {
        let selector = selector_with(vec![ProviderId::OpenAi], 10);
        for _ in 0..5 {
            selector
                .registry()
                .report_error(ProviderId::OpenAi, "gpt-4o", &upstream_error(ProviderId::OpenAi));
        }
        std::thread::sleep(Duration::from_millis(20));

        let route = selector.select(&meta()).unwrap();
        let deadline = CancellationToken::new();
        let result = selector
            .execute_route::<(), _, _>(&route, &deadline, false, |provider, _, _| async move {
                Err(upstream_error(provider))
            })
            .await;

        assert!(result.is_err());
        // Probe failed: circuit reopened, provider unavailable again.
        assert!(!selector.registry().is_available(ProviderId::OpenAi));
    }

    #[tokio::test]
    async fn test_successful_probe_closes_circuit_via_route() {
        let selector = selector_with(vec![ProviderId::OpenAi], 10);
        for _ in 0..5 {
            selector
                .registry()
                .report_error(ProviderId::OpenAi, "gpt-4o", &upstream_error(ProviderId::OpenAi));
        }
        std::thread::sleep(Duration::from_millis(20));

        let route = selector.select(&meta()).unwrap();
        let deadline = CancellationToken::new();
        selector
            .execute_route(&route, &deadline, false, |_, _, _| async { Ok(()) })
            .await
            .unwrap();

        assert!(selector.registry().is_available(ProviderId::OpenAi));
        assert_eq!(
            selector.registry().circuit_state(ProviderId::OpenAi),
            Some(CircuitState::Closed)
        );
    }

    #[tokio::test]
    async fn test_select_with_fallback_end_to_end() {
        let selector = selector_with(vec![ProviderId::OpenAi, ProviderId::Anthropic], 30_000);
        let deadline = CancellationToken::new();

        let outcome = selector
            .select_with_fallback(&meta(), &deadline, |provider, model, _| async move {
                if provider == ProviderId::Anthropic {
                    Ok(model)
                } else {
                    Err(Error::Upstream {
                        provider,
                        status: 500,
                        message: "boom".to_string(),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.provider, ProviderId::Anthropic);
        assert!(outcome.attempts.len() >= 2);
    }
}
