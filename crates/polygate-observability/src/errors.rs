//! Error tracking per provider and status class

use crate::counter::RequestCounter;
use crate::ring::RingBuffer;
use chrono::Utc;
use polygate_core::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub provider: Option<ProviderId>,
    pub status: Option<u16>,
    pub message: String,
    pub at_unix: i64,
}

/// Deep-copied snapshot served at `/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Errors per request over the process lifetime, 0.0 when no traffic.
    pub error_rate: f64,
    pub by_provider: HashMap<ProviderId, u64>,
    /// Counts keyed by status class ("4xx", "5xx", "network").
    pub by_class: HashMap<String, u64>,
    pub recent: Vec<ErrorRecord>,
}

struct ErrorState {
    total_errors: u64,
    by_provider: HashMap<ProviderId, u64>,
    by_class: HashMap<String, u64>,
    recent: RingBuffer<ErrorRecord>,
}

pub struct ErrorTracker {
    counter: Arc<RequestCounter>,
    state: Mutex<ErrorState>,
}

fn status_class(status: Option<u16>) -> String {
    match status {
        Some(code) if (400..500).contains(&code) => "4xx".to_string(),
        Some(code) if (500..600).contains(&code) => "5xx".to_string(),
        Some(code) => code.to_string(),
        None => "network".to_string(),
    }
}

impl ErrorTracker {
    pub fn new(counter: Arc<RequestCounter>, recent_capacity: usize) -> Self {
        Self {
            counter,
            state: Mutex::new(ErrorState {
                total_errors: 0,
                by_provider: HashMap::new(),
                by_class: HashMap::new(),
                recent: RingBuffer::new(recent_capacity),
            }),
        }
    }

    pub fn record(&self, provider: Option<ProviderId>, status: Option<u16>, message: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.total_errors += 1;
        if let Some(provider) = provider {
            *state.by_provider.entry(provider).or_insert(0) += 1;
        }
        *state.by_class.entry(status_class(status)).or_insert(0) += 1;
        state.recent.push(ErrorRecord {
            provider,
            status,
            message: message.chars().take(256).collect(),
            at_unix: Utc::now().timestamp(),
        });
    }

    pub fn snapshot(&self) -> ErrorSnapshot {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total_requests = self.counter.total();
        ErrorSnapshot {
            total_requests,
            total_errors: state.total_errors,
            error_rate: if total_requests == 0 {
                0.0
            } else {
                state.total_errors as f64 / total_requests as f64
            },
            by_provider: state.by_provider.clone(),
            by_class: state.by_class.clone(),
            recent: state.recent.snapshot(),
        }
    }
}
