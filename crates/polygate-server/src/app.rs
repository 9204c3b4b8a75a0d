//! Router assembly
//!
//! Layers are applied bottom-up, so the list below reads innermost-first;
//! the resulting execution order is the declared pipeline: request id →
//! logger → shutdown gate → auth → body limit → parse+validate → rate
//! limit → deadline → smart router → semantic cache → chat handler.

use crate::middleware;
use crate::state::AppState;
use crate::{chat, meta};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;

/// Build the full gateway router.
pub fn build_router(state: AppState) -> Router {
    let chat_routes = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .layer(from_fn_with_state(state.clone(), middleware::cache_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::router_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::deadline_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .layer(from_fn(middleware::parse_validate_middleware))
        .layer(from_fn(middleware::body_limit_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::shutdown_gate_middleware,
        ));

    let metrics_routes = Router::new()
        .route("/metrics", get(meta::metrics))
        .route("/metrics/costs", get(meta::metrics_costs))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::shutdown_gate_middleware,
        ));

    let public_routes = Router::new()
        .route("/health", get(meta::health))
        .route("/ready", get(meta::ready));

    Router::new()
        .merge(chat_routes)
        .merge(metrics_routes)
        .merge(public_routes)
        .layer(from_fn(middleware::request_logger_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .with_state(state)
}
