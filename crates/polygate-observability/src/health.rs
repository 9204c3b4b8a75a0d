//! Readiness checks aggregated for `/ready`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named dependency check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReadinessCheck {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Aggregate of all checks; ready only when every check passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: BTreeMap<String, ReadinessCheck>,
}

impl ReadinessReport {
    pub fn from_checks(checks: Vec<ReadinessCheck>) -> Self {
        let ready = checks.iter().all(|check| check.ok);
        Self {
            ready,
            checks: checks
                .into_iter()
                .map(|check| (check.name.clone(), check))
                .collect(),
        }
    }
}
