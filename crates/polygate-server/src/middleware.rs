//! The ordered middleware stack for `/v1/chat/completions`
//!
//! Declared order (outermost first): request id → request logger →
//! shutdown gate → auth → body limit → parse+validate → rate limit →
//! deadline → smart router → semantic cache → chat handler. Each
//! middleware communicates downstream through request extensions; nothing
//! re-parses the body.

use crate::config::MAX_BODY_BYTES;
use crate::error::error_response;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use polygate_cache::CacheOutcome;
use polygate_core::{
    ChatRequest, ChatResponse, Error, ProviderId, RequestMetadata, RoutingHints, RoutingStrategy,
};
use polygate_routing::SelectedRoute;
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

/// Request id, generated when the client does not supply one.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// The parsed, validated body. Downstream reads this, never the raw body.
#[derive(Debug, Clone)]
pub struct ParsedRequest(pub Arc<ChatRequest>);

/// Provider attributed to the requested model before routing.
#[derive(Debug, Clone, Copy)]
pub struct DetectedProvider(pub ProviderId);

/// The per-request deadline. This token is the single source of truth for
/// cancelling the upstream call.
#[derive(Debug, Clone)]
pub struct Deadline {
    pub token: CancellationToken,
    pub timeout: Duration,
}

/// Ranked route selection stashed by the smart router.
#[derive(Clone)]
pub struct Route(pub Arc<SelectedRoute>);

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(|value| value.to_string())
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()));

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub async fn request_logger_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let started = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

pub async fn shutdown_gate_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.draining.load(Ordering::Acquire) {
        let body = json!({
            "error": {
                "message": "The gateway is shutting down",
                "type": "server_error",
                "code": 503,
            }
        });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }
    next.run(req).await
}

/// Bearer auth with a constant-time comparison: timing never reveals how
/// much of a candidate key matched.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| {
            bool::from(token.as_bytes().ct_eq(state.config.api_key.as_bytes()))
        })
        .unwrap_or(false);

    if !authorized {
        return error_response(&Error::Unauthorized, false);
    }
    next.run(req).await
}

/// Early rejection on declared Content-Length; the parse middleware
/// enforces the same limit on the actual bytes for chunked bodies.
pub async fn body_limit_middleware(req: Request, next: Next) -> Response {
    if let Some(length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return error_response(
                &Error::BodyTooLarge {
                    size: length,
                    max: MAX_BODY_BYTES,
                },
                false,
            );
        }
    }
    next.run(req).await
}

/// Parse the body exactly once, validate, and stash the result.
pub async fn parse_validate_middleware(req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                &Error::BodyTooLarge {
                    size: MAX_BODY_BYTES + 1,
                    max: MAX_BODY_BYTES,
                },
                false,
            )
        }
    };

    let chat_request: ChatRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(error) => {
            return error_response(
                &Error::InvalidRequest(format!("malformed request body: {error}")),
                false,
            )
        }
    };
    if let Err(error) = chat_request.validate() {
        return error_response(&error, false);
    }

    parts.extensions.insert(ParsedRequest(Arc::new(chat_request)));
    next.run(Request::from_parts(parts, Body::empty())).await
}

/// Attribute the requested model to a provider and take one token from
/// that provider's bucket.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(parsed) = req.extensions().get::<ParsedRequest>().cloned() else {
        return error_response(&Error::Internal("request body missing".to_string()), false);
    };

    let Some(provider) = state.catalog.provider_for(&parsed.0.model) else {
        return error_response(
            &Error::InvalidRequest(format!(
                "unknown provider for model {:?}",
                parsed.0.model
            )),
            false,
        );
    };

    let bucket = match state.buckets.bucket(provider) {
        Ok(bucket) => bucket,
        Err(error) => return error_response(&error, false),
    };

    if !bucket.try_acquire() {
        let retry_after = bucket.retry_after_secs();
        let error = Error::RateLimited {
            provider,
            retry_after_secs: retry_after,
            limit: bucket.limit(),
            remaining: bucket.remaining(),
        };
        let mut response = error_response(&error, false);
        let headers = response.headers_mut();
        headers.insert("retry-after", HeaderValue::from(retry_after));
        headers.insert("x-ratelimit-limit", HeaderValue::from(bucket.limit()));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(bucket.remaining()));
        return response;
    }

    req.extensions_mut().insert(DetectedProvider(provider));
    next.run(req).await
}

/// Establish the per-request deadline token. The watchdog cancels the
/// token when the timeout elapses; it exits early if something else
/// cancels first.
pub async fn deadline_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_ms = match req
        .headers()
        .get("x-timeout-ms")
        .map(|value| value.to_str().unwrap_or_default().trim().parse::<u64>())
    {
        None => None,
        Some(Ok(ms)) => Some(ms),
        Some(Err(_)) => {
            return error_response(
                &Error::InvalidRequest("X-Timeout-Ms must be a positive integer".to_string()),
                false,
            )
        }
    };

    let provider = req.extensions().get::<DetectedProvider>().map(|d| d.0);
    let timeout = state.config.resolve_timeout(header_ms, provider);

    let token = CancellationToken::new();
    let watchdog = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => watchdog.cancel(),
            _ = watchdog.cancelled() => {}
        }
    });

    req.extensions_mut().insert(Deadline {
        token,
        timeout,
    });
    next.run(req).await
}

fn parse_hints(req: &Request) -> Result<RoutingHints, Error> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    };

    let strategy = match header("x-routing-strategy") {
        None => None,
        Some(raw) => Some(
            RoutingStrategy::from_str(&raw)
                .map_err(|_| Error::InvalidRequest(format!("invalid routing strategy: {raw:?}")))?,
        ),
    };
    let prefer_provider = match header("x-routing-prefer-provider") {
        None => None,
        Some(raw) => Some(
            ProviderId::from_str(&raw)
                .map_err(|_| Error::InvalidRequest(format!("invalid provider: {raw:?}")))?,
        ),
    };
    let max_latency_ms = match header("x-routing-max-latency-ms") {
        None => None,
        Some(raw) => {
            let value = raw.parse::<u64>().ok().filter(|v| *v > 0).ok_or_else(|| {
                Error::InvalidRequest("x-routing-max-latency-ms must be a positive integer".to_string())
            })?;
            Some(value)
        }
    };
    let max_cost_per_1k = match header("x-routing-max-cost") {
        None => None,
        Some(raw) => {
            let value = raw
                .parse::<f64>()
                .ok()
                .filter(|v| *v > 0.0 && v.is_finite())
                .ok_or_else(|| {
                    Error::InvalidRequest("x-routing-max-cost must be a positive number".to_string())
                })?;
            Some(value)
        }
    };

    Ok(RoutingHints {
        strategy,
        prefer_provider,
        max_latency_ms,
        max_cost_per_1k,
    })
}

/// Rank providers for this request and stash the route. The post-`next`
/// step runs for error responses too: request-level outcomes land in the
/// error tracker here, while per-attempt breaker updates happen inside the
/// fallback execute adapter.
pub async fn router_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(parsed) = req.extensions().get::<ParsedRequest>().cloned() else {
        return error_response(&Error::Internal("request body missing".to_string()), false);
    };
    let hints = match parse_hints(&req) {
        Ok(hints) => hints,
        Err(error) => return error_response(&error, false),
    };

    state.counter.increment();
    let meta = RequestMetadata::from_request(&parsed.0, hints);
    let route = match state.selector.select(&meta) {
        Ok(route) => route,
        Err(error) => {
            state.errors.record(None, Some(503), &error.to_string());
            return error_response(&error, state.config.expose_upstream_errors);
        }
    };

    let primary = route.primary().provider;
    req.extensions_mut().insert(Route(Arc::new(route)));

    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    if status.as_u16() >= 400 {
        state.errors.record(
            Some(primary),
            Some(status.as_u16()),
            status.canonical_reason().unwrap_or("request failed"),
        );
    }
    tracing::debug!(
        provider = %primary,
        status = status.as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "routed request finished"
    );
    response
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Serve semantically similar responses; store successful buffered
/// responses asynchronously after `next` completes.
pub async fn cache_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let cache_header = |response: &mut Response, value: &'static str| {
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static(value));
    };

    let Some(cache) = state.cache.clone() else {
        let mut response = next.run(req).await;
        cache_header(&mut response, "DISABLED");
        return response;
    };
    let Some(parsed) = req.extensions().get::<ParsedRequest>().cloned() else {
        return next.run(req).await;
    };

    let skip_requested = req
        .headers()
        .get("x-skip-cache")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    if skip_requested || parsed.0.is_streaming() || !cache.enabled() {
        let mut response = next.run(req).await;
        cache_header(&mut response, if cache.enabled() { "SKIP" } else { "DISABLED" });
        return response;
    }

    if let CacheOutcome::Hit { response, distance } = cache.lookup(&parsed.0).await {
        // Short-circuit: any half-open probe this selection claimed will
        // never be exercised, so hand it back.
        if let Some(route) = req.extensions().get::<Route>() {
            for provider in &route.0.claimed_probes {
                state.selector.registry().release_probe(*provider);
            }
        }
        let mut http_response = Json(&response).into_response();
        cache_header(&mut http_response, "HIT");
        if let Ok(score) = HeaderValue::from_str(&format!("{distance:.4}")) {
            http_response.headers_mut().insert("x-cache-score", score);
        }
        return http_response;
    }

    let mut response = next.run(req).await;
    cache_header(&mut response, "MISS");
    if response.status() != StatusCode::OK || is_event_stream(&response) {
        return response;
    }

    // Buffer the finished response so the store can happen off the request
    // path, then hand the same bytes back to the client.
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return error_response(
                &Error::Internal(format!("failed to buffer response: {error}")),
                false,
            )
        }
    };
    if let Ok(chat_response) = serde_json::from_slice::<ChatResponse>(&bytes) {
        let request = Arc::clone(&parsed.0);
        tokio::spawn(async move {
            if let Err(error) = cache.store(&request, &chat_response).await {
                tracing::warn!(error = %error, "async cache store failed");
            }
        });
    }
    Response::from_parts(parts, Body::from(bytes))
}
