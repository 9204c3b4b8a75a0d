//! Terminal chat route: fallback-enabled upstream call, buffered or SSE
//!
//! The handler reads everything it needs from request extensions (parsed
//! body, ranked route, deadline token) and drives the selector's fallback
//! chain. Streaming gets one attempt per provider, and once the first
//! byte has gone to the client there is no failover: the SSE body either
//! completes or terminates.

use crate::error::error_response;
use crate::middleware::{Deadline, ParsedRequest, Route};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use polygate_core::{ChatRequest, Error, ProviderId, StreamChunk, Usage};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

pub async fn chat_completions(State(state): State<AppState>, req: Request) -> Response {
    let expose = state.config.expose_upstream_errors;
    let (Some(parsed), Some(route), Some(deadline)) = (
        req.extensions().get::<ParsedRequest>().cloned(),
        req.extensions().get::<Route>().cloned(),
        req.extensions().get::<Deadline>().cloned(),
    ) else {
        return error_response(
            &Error::Internal("request context incomplete".to_string()),
            expose,
        );
    };

    if parsed.0.is_streaming() {
        streaming_completion(state, parsed.0, route, deadline).await
    } else {
        buffered_completion(state, parsed.0, route, deadline).await
    }
}

async fn buffered_completion(
    state: AppState,
    request: Arc<ChatRequest>,
    route: Route,
    deadline: Deadline,
) -> Response {
    let errors = Arc::clone(&state.errors);
    let dispatcher = Arc::clone(&state.dispatcher);
    let result = state
        .selector
        .execute_route(&route.0, &deadline.token, false, |provider, model, token| {
            let dispatcher = Arc::clone(&dispatcher);
            let errors = Arc::clone(&errors);
            let mut upstream_request = (*request).clone();
            upstream_request.model = model;
            async move {
                let result = dispatcher.send(provider, &upstream_request, &token).await;
                if let Err(error) = &result {
                    if !matches!(error, Error::Cancelled) {
                        errors.record(Some(provider), error.upstream_status(), &error.to_string());
                    }
                }
                result
            }
        })
        .await;

    match result {
        Ok(outcome) => {
            state
                .costs
                .record(outcome.provider, &outcome.model, &outcome.value.usage);
            Json(outcome.value).into_response()
        }
        Err(error) => error_response(&error, state.config.expose_upstream_errors),
    }
}

/// Accumulates what the stream produced so usage can be priced at the end.
struct StreamAccounting {
    output_chars: usize,
    reported_usage: Option<Usage>,
}

async fn streaming_completion(
    state: AppState,
    request: Arc<ChatRequest>,
    route: Route,
    deadline: Deadline,
) -> Response {
    let errors = Arc::clone(&state.errors);
    let dispatcher = Arc::clone(&state.dispatcher);
    let result = state
        .selector
        .execute_route(&route.0, &deadline.token, true, |provider, model, token| {
            let dispatcher = Arc::clone(&dispatcher);
            let errors = Arc::clone(&errors);
            let mut upstream_request = (*request).clone();
            upstream_request.model = model;
            async move {
                let result = dispatcher.stream(provider, &upstream_request, &token).await;
                if let Err(error) = &result {
                    if !matches!(error, Error::Cancelled) {
                        errors.record(Some(provider), error.upstream_status(), &error.to_string());
                    }
                }
                result
            }
        })
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => return error_response(&error, state.config.expose_upstream_errors),
    };
    let provider = outcome.provider;
    let model = outcome.model.clone();
    let accounting = Arc::new(Mutex::new(StreamAccounting {
        output_chars: 0,
        reported_usage: None,
    }));

    // From here on bytes reach the client; upstream failures terminate the
    // stream instead of failing over to another provider.
    let tally = Arc::clone(&accounting);
    let events = outcome
        .value
        .take_while(move |item| {
            let keep = match item {
                Ok(chunk) => {
                    let mut tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(usage) = chunk.usage {
                        tally.reported_usage = Some(usage);
                    }
                    tally.output_chars += chunk
                        .choices
                        .iter()
                        .filter_map(|choice| choice.delta.content.as_deref())
                        .map(|content| content.chars().count())
                        .sum::<usize>();
                    true
                }
                Err(error) => {
                    tracing::warn!(error = %error, "terminating stream after upstream error");
                    false
                }
            };
            futures::future::ready(keep)
        })
        .filter_map(|item| async move {
            let chunk: StreamChunk = item.ok()?;
            let json = serde_json::to_string(&chunk).ok()?;
            Some(Ok::<Event, Infallible>(Event::default().data(json)))
        })
        .chain(futures::stream::once(finalize_stream(
            state.clone(),
            provider,
            model,
            accounting,
        )));

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// Emit the `[DONE]` sentinel and settle cost accounting: provider-reported
/// usage when present, the chars/4 estimate only when enabled.
async fn finalize_stream(
    state: AppState,
    provider: ProviderId,
    model: String,
    accounting: Arc<Mutex<StreamAccounting>>,
) -> Result<Event, Infallible> {
    let (reported, output_chars) = {
        let tally = accounting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (tally.reported_usage, tally.output_chars)
    };
    let usage = reported.or_else(|| {
        if state.config.estimate_stream_usage {
            // chars/4 is a crude estimate and stays opt-in.
            let completion_tokens = output_chars.div_ceil(4) as u32;
            Some(Usage {
                prompt_tokens: 0,
                completion_tokens,
                total_tokens: completion_tokens,
            })
        } else {
            None
        }
    });
    if let Some(usage) = usage {
        state.costs.record(provider, &model, &usage);
    }
    Ok(Event::default().data("[DONE]"))
}
