//! Per-provider latency tracking: EMA plus bounded windowed percentiles
//!
//! Successful samples feed both the exponential moving average and the
//! percentile window. Failures are appended to the record log only: a
//! provider that fails fast must not look fast, or the scorer would reward
//! it with more traffic.

use chrono::Utc;
use polygate_core::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct LatencyTrackerConfig {
    /// Bounded sample window per provider (FIFO eviction).
    pub window: usize,
    /// EMA smoothing factor, `ema' = alpha * x + (1 - alpha) * ema`.
    pub alpha: f64,
}

impl Default for LatencyTrackerConfig {
    fn default() -> Self {
        Self {
            window: 100,
            alpha: 0.3,
        }
    }
}

/// One recorded call, success or failure.
#[derive(Debug, Clone)]
pub struct LatencyRecord {
    pub model: String,
    pub ttfb_ms: u64,
    pub total_ms: u64,
    pub success: bool,
}

#[derive(Debug, Default)]
struct ProviderLatency {
    /// Successful total-ms samples, oldest first.
    window: VecDeque<u64>,
    ema_ms: Option<f64>,
    /// All records including failures, bounded like the window.
    records: VecDeque<LatencyRecord>,
    sample_count: u64,
    error_count: u64,
    last_updated_unix: Option<i64>,
}

/// Snapshot of one provider's latency profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub provider: ProviderId,
    pub samples: u64,
    pub errors: u64,
    pub ema_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub last_updated_unix: Option<i64>,
}

impl LatencyStats {
    fn empty(provider: ProviderId) -> Self {
        Self {
            provider,
            samples: 0,
            errors: 0,
            ema_ms: 0.0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            last_updated_unix: None,
        }
    }
}

/// Nearest-rank percentile: `sorted[ceil(p/100 * n) - 1]`.
fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug)]
pub struct LatencyTracker {
    config: LatencyTrackerConfig,
    slots: [Mutex<ProviderLatency>; 3],
}

impl LatencyTracker {
    pub fn new(config: LatencyTrackerConfig) -> Self {
        Self {
            config,
            slots: [
                Mutex::new(ProviderLatency::default()),
                Mutex::new(ProviderLatency::default()),
                Mutex::new(ProviderLatency::default()),
            ],
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LatencyTrackerConfig::default())
    }

    fn slot(&self, provider: ProviderId) -> &Mutex<ProviderLatency> {
        let index = match provider {
            ProviderId::OpenAi => 0,
            ProviderId::Anthropic => 1,
            ProviderId::Google => 2,
        };
        &self.slots[index]
    }

    /// Record one call. Failed calls are kept in the record log but never
    /// touch the EMA or percentile window.
    pub fn record(
        &self,
        provider: ProviderId,
        model: &str,
        ttfb_ms: u64,
        total_ms: u64,
        success: bool,
    ) {
        let mut slot = self
            .slot(provider)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        slot.records.push_back(LatencyRecord {
            model: model.to_string(),
            ttfb_ms,
            total_ms,
            success,
        });
        if slot.records.len() > self.config.window {
            slot.records.pop_front();
        }
        slot.last_updated_unix = Some(Utc::now().timestamp());

        if !success {
            slot.error_count += 1;
            return;
        }

        slot.sample_count += 1;
        slot.window.push_back(total_ms);
        if slot.window.len() > self.config.window {
            slot.window.pop_front();
        }
        let x = total_ms as f64;
        slot.ema_ms = Some(match slot.ema_ms {
            // Seed with the first observation
            None => x,
            Some(ema) => self.config.alpha * x + (1.0 - self.config.alpha) * ema,
        });
    }

    /// Smoothed latency, `None` until the first successful sample.
    pub fn ema(&self, provider: ProviderId) -> Option<f64> {
        self.slot(provider)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ema_ms
    }

    /// Nearest-rank percentile over the current window, `None` when empty.
    pub fn percentile(&self, provider: ProviderId, percentile: f64) -> Option<u64> {
        let slot = self
            .slot(provider)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = slot.window.iter().copied().collect();
        sorted.sort_unstable();
        Some(nearest_rank(&sorted, percentile))
    }

    /// Full snapshot; zero-valued when no samples exist.
    pub fn stats(&self, provider: ProviderId) -> LatencyStats {
        let slot = self
            .slot(provider)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.window.is_empty() && slot.error_count == 0 {
            return LatencyStats::empty(provider);
        }
        let mut sorted: Vec<u64> = slot.window.iter().copied().collect();
        sorted.sort_unstable();
        LatencyStats {
            provider,
            samples: slot.sample_count,
            errors: slot.error_count,
            ema_ms: slot.ema_ms.unwrap_or(0.0),
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
            last_updated_unix: slot.last_updated_unix,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_stats_are_zero_valued() {
        let tracker = LatencyTracker::with_defaults();
        let stats = tracker.stats(ProviderId::OpenAi);
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.ema_ms, 0.0);
        assert_eq!(stats.p95_ms, 0);
        assert!(stats.last_updated_unix.is_none());
    }

    #[test]
    fn test_ema_seeds_with_first_sample() {
        let tracker = LatencyTracker::with_defaults();
        tracker.record(ProviderId::OpenAi, "gpt-4o", 50, 200, true);
        assert_eq!(tracker.ema(ProviderId::OpenAi), Some(200.0));
    }

    #[test]
    fn test_ema_formula() {
        let tracker = LatencyTracker::new(LatencyTrackerConfig {
            window: 100,
            alpha: 0.3,
        });
        tracker.record(ProviderId::OpenAi, "gpt-4o", 0, 100, true);
        tracker.record(ProviderId::OpenAi, "gpt-4o", 0, 200, true);
        // 0.3 * 200 + 0.7 * 100 = 130
        let ema = tracker.ema(ProviderId::OpenAi).unwrap();
        assert!((ema - 130.0).abs() < 1e-9, "got {ema}");
    }

    #[test]
    fn test_errors_do_not_move_ema() {
        let tracker = LatencyTracker::with_defaults();
        tracker.record(ProviderId::Anthropic, "claude", 0, 400, true);
        let before = tracker.ema(ProviderId::Anthropic);
        tracker.record(ProviderId::Anthropic, "claude", 0, 0, false);
        tracker.record(ProviderId::Anthropic, "claude", 0, 0, false);
        assert_eq!(tracker.ema(ProviderId::Anthropic), before);
        let stats = tracker.stats(ProviderId::Anthropic);
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.errors, 2);
    }

    #[test]
    fn test_errors_do_not_enter_percentiles() {
        let tracker = LatencyTracker::with_defaults();
        tracker.record(ProviderId::Google, "gemini", 0, 300, true);
        tracker.record(ProviderId::Google, "gemini", 0, 0, false);
        assert_eq!(tracker.percentile(ProviderId::Google, 50.0), Some(300));
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let tracker = LatencyTracker::with_defaults();
        for ms in 1..=100u64 {
            tracker.record(ProviderId::OpenAi, "gpt-4o", 0, ms, true);
        }
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 50.0), Some(50));
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 95.0), Some(95));
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 99.0), Some(99));
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 100.0), Some(100));
    }

    #[test]
    fn test_window_eviction_is_fifo() {
        let tracker = LatencyTracker::new(LatencyTrackerConfig {
            window: 3,
            alpha: 0.3,
        });
        for ms in [10, 20, 30, 40] {
            tracker.record(ProviderId::OpenAi, "gpt-4o", 0, ms, true);
        }
        // Window holds 20, 30, 40 after evicting the oldest.
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 50.0), Some(30));
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 99.0), Some(40));
    }

    #[test]
    fn test_percentile_none_when_empty() {
        let tracker = LatencyTracker::with_defaults();
        assert_eq!(tracker.percentile(ProviderId::OpenAi, 95.0), None);
        assert_eq!(tracker.ema(ProviderId::OpenAi), None);
    }

    #[test]
    fn test_providers_are_independent() {
        let tracker = LatencyTracker::with_defaults();
        tracker.record(ProviderId::OpenAi, "gpt-4o", 0, 100, true);
        assert_eq!(tracker.ema(ProviderId::Anthropic), None);
        assert_eq!(tracker.ema(ProviderId::Google), None);
    }

    #[test]
    fn test_stats_round_trip() {
        let tracker = LatencyTracker::with_defaults();
        tracker.record(ProviderId::OpenAi, "gpt-4o", 10, 150, true);
        let stats = tracker.stats(ProviderId::OpenAi);
        let json = serde_json::to_string(&stats).unwrap();
        let back: LatencyStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn test_concurrent_recording() {
        let tracker = Arc::new(LatencyTracker::with_defaults());
        let mut handles = vec![];
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for ms in 0..100u64 {
                    tracker.record(ProviderId::OpenAi, "gpt-4o", 0, ms, true);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = tracker.stats(ProviderId::OpenAi);
        assert_eq!(stats.samples, 800);
        assert!(stats.ema_ms.is_finite());
    }
}
