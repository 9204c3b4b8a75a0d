//! Provider registry: per-provider health and circuit-breaker state
//!
//! Each configured provider owns a mutex-guarded entry (never one global
//! lock) plus an atomic half-open probe flag. State machine per provider:
//!
//! - CLOSED → OPEN: consecutive errors reach the threshold
//! - OPEN → HALF_OPEN: cooldown elapses and a caller claims the probe
//! - HALF_OPEN → CLOSED: the probe succeeds
//! - HALF_OPEN → OPEN: the probe fails (opened-at reset to now)
//!
//! Queries (`provider_states`, `is_available`) are pure reads. Claiming the
//! half-open probe is the explicit `try_claim_probe` operation, a
//! compare-and-set so that concurrent admission lets exactly one probe
//! through.

use crate::latency::{LatencyStats, LatencyTracker};
use chrono::{DateTime, Utc};
use polygate_core::{Error, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive errors before the circuit opens.
    pub error_threshold: u32,
    /// How long an open circuit rejects traffic before allowing a probe.
    pub cooldown: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit-breaker state derived from an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct ProviderEntry {
    consecutive_errors: u32,
    last_error_at: Option<DateTime<Utc>>,
    /// Monotonic instant the circuit opened; `None` while closed.
    opened_at: Option<Instant>,
    rate_limit_remaining: Option<u64>,
    rate_limit_reset_at: Option<DateTime<Utc>>,
}

struct ProviderSlot {
    entry: Mutex<ProviderEntry>,
    probe_in_flight: AtomicBool,
}

impl ProviderSlot {
    fn new() -> Self {
        Self {
            entry: Mutex::new(ProviderEntry::default()),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

/// Immutable snapshot handed to the routing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderState {
    pub provider: ProviderId,
    pub available: bool,
    pub circuit: CircuitState,
    pub consecutive_errors: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub rate_limit_remaining: Option<u64>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub latency: LatencyStats,
}

pub struct ProviderRegistry {
    config: RegistryConfig,
    providers: Vec<ProviderId>,
    slots: HashMap<ProviderId, ProviderSlot>,
    tracker: Arc<LatencyTracker>,
}

impl ProviderRegistry {
    /// Build the registry for the configured provider list. Entries live
    /// for the process lifetime.
    pub fn new(
        providers: Vec<ProviderId>,
        config: RegistryConfig,
        tracker: Arc<LatencyTracker>,
    ) -> Self {
        let slots = providers
            .iter()
            .map(|&provider| (provider, ProviderSlot::new()))
            .collect();
        Self {
            config,
            providers,
            slots,
            tracker,
        }
    }

    pub fn providers(&self) -> &[ProviderId] {
        &self.providers
    }

    pub fn tracker(&self) -> &Arc<LatencyTracker> {
        &self.tracker
    }

    fn slot(&self, provider: ProviderId) -> Option<&ProviderSlot> {
        self.slots.get(&provider)
    }

    fn circuit_of(&self, entry: &ProviderEntry) -> CircuitState {
        match entry.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) => {
                if opened_at.elapsed() < self.config.cooldown {
                    CircuitState::Open
                } else {
                    CircuitState::HalfOpen
                }
            }
        }
    }

    fn availability(&self, entry: &ProviderEntry, slot: &ProviderSlot) -> bool {
        match entry.opened_at {
            None => true,
            Some(opened_at) => {
                if opened_at.elapsed() < self.config.cooldown {
                    false
                } else {
                    // Half-open: available only while nobody holds the probe.
                    !slot.probe_in_flight.load(Ordering::Acquire)
                }
            }
        }
    }

    /// Pure read: can this provider take traffic right now?
    pub fn is_available(&self, provider: ProviderId) -> bool {
        let Some(slot) = self.slot(provider) else {
            return false;
        };
        let entry = slot
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.availability(&entry, slot)
    }

    /// Current circuit state for telemetry.
    pub fn circuit_state(&self, provider: ProviderId) -> Option<CircuitState> {
        let slot = self.slot(provider)?;
        let entry = slot
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(self.circuit_of(&entry))
    }

    /// Snapshot every configured provider, in configuration order.
    pub fn provider_states(&self) -> Vec<ProviderState> {
        self.providers
            .iter()
            .filter_map(|&provider| {
                let slot = self.slot(provider)?;
                let entry = slot
                    .entry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                Some(ProviderState {
                    provider,
                    available: self.availability(&entry, slot),
                    circuit: self.circuit_of(&entry),
                    consecutive_errors: entry.consecutive_errors,
                    last_error_at: entry.last_error_at,
                    rate_limit_remaining: entry.rate_limit_remaining,
                    rate_limit_reset_at: entry.rate_limit_reset_at,
                    latency: self.tracker.stats(provider),
                })
            })
            .collect()
    }

    /// Claim the single half-open probe. Returns true for exactly one
    /// caller once the cooldown has elapsed; everyone else keeps seeing
    /// the provider as unavailable until the probe resolves.
    pub fn try_claim_probe(&self, provider: ProviderId) -> bool {
        let Some(slot) = self.slot(provider) else {
            return false;
        };
        {
            let entry = slot
                .entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match entry.opened_at {
                None => return false,
                Some(opened_at) => {
                    if opened_at.elapsed() < self.config.cooldown {
                        return false;
                    }
                }
            }
        }
        slot.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release a claimed probe without an attempt having been made, so an
    /// unused claim cannot wedge the provider in half-open.
    pub fn release_probe(&self, provider: ProviderId) {
        if let Some(slot) = self.slot(provider) {
            slot.probe_in_flight.store(false, Ordering::Release);
        }
    }

    /// Record a successful call: reset the error counter, close the
    /// circuit, release the probe, and feed the latency tracker.
    pub fn report_success(&self, provider: ProviderId, model: &str, latency_ms: u64) {
        let Some(slot) = self.slot(provider) else {
            return;
        };
        {
            let mut entry = slot
                .entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entry.consecutive_errors = 0;
            if entry.opened_at.take().is_some() {
                tracing::info!(provider = %provider, "circuit closed after successful probe");
            }
        }
        slot.probe_in_flight.store(false, Ordering::Release);
        self.tracker.record(provider, model, 0, latency_ms, true);
    }

    /// Record a failed call: bump the error counter, open the circuit at
    /// the threshold (or immediately on a failed probe), and log the error
    /// sample without touching the EMA.
    pub fn report_error(&self, provider: ProviderId, model: &str, error: &Error) {
        let Some(slot) = self.slot(provider) else {
            return;
        };
        let probe_failed = slot.probe_in_flight.swap(false, Ordering::AcqRel);
        {
            let mut entry = slot
                .entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entry.consecutive_errors = entry.consecutive_errors.saturating_add(1);
            entry.last_error_at = Some(Utc::now());

            if probe_failed {
                entry.opened_at = Some(Instant::now());
                tracing::warn!(provider = %provider, error = %error, "half-open probe failed, circuit reopened");
            } else if entry.consecutive_errors >= self.config.error_threshold
                && entry.opened_at.is_none()
            {
                entry.opened_at = Some(Instant::now());
                tracing::warn!(
                    provider = %provider,
                    consecutive_errors = entry.consecutive_errors,
                    "circuit breaker opened"
                );
            }
        }
        self.tracker.record(provider, model, 0, 0, false);
    }

    /// Replace the provider-reported rate-limit counters.
    pub fn update_rate_limit(
        &self,
        provider: ProviderId,
        remaining: u64,
        reset_at: Option<DateTime<Utc>>,
    ) {
        if let Some(slot) = self.slot(provider) {
            let mut entry = slot
                .entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entry.rate_limit_remaining = Some(remaining);
            entry.rate_limit_reset_at = reset_at;
        }
    }
}
