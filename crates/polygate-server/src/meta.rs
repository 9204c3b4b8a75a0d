//! Health, readiness, and metrics routes

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use polygate_observability::{ReadinessCheck, ReadinessReport};
use serde_json::json;

/// Liveness. Deliberately carries nothing but the status: uptime or build
/// info would leak to unauthenticated callers.
pub async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Readiness: 200 when every dependency check passes, 503 with the check
/// map otherwise.
pub async fn ready(State(state): State<AppState>) -> Response {
    let mut checks = vec![ReadinessCheck::ok("config")];

    if state.registry.providers().is_empty() {
        checks.push(ReadinessCheck::failed("providers", "no providers configured"));
    } else {
        checks.push(ReadinessCheck::ok("providers"));
    }

    match &state.cache {
        None => checks.push(ReadinessCheck::ok("cache")),
        Some(cache) if cache.enabled() => checks.push(ReadinessCheck::ok("cache")),
        Some(_) => checks.push(ReadinessCheck::failed("cache", "cache configured but disabled")),
    }

    let report = ReadinessReport::from_checks(checks);
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Authenticated operational snapshot: provider health, circuit state,
/// latency profiles, error counters.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let body = json!({
        "providers": state.registry.provider_states(),
        "errors": state.errors.snapshot(),
        "total_requests": state.counter.total(),
    });
    Json(body).into_response()
}

/// Authenticated cost snapshot.
pub async fn metrics_costs(State(state): State<AppState>) -> Response {
    Json(state.costs.snapshot()).into_response()
}
