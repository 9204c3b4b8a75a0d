//! Terminal error mapping to the OpenAI-compatible envelope
//!
//! Every failure leaving the gateway wears the same envelope:
//! `{"error": {"message", "type", "code", "provider"?}}`. Upstream error
//! text is replaced with a generic message unless the deployment opts in
//! to exposing it; the original always goes to the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use polygate_core::Error;
use serde_json::json;

const GENERIC_UPSTREAM_MESSAGE: &str = "The upstream provider returned an error";

/// Map an upstream 4xx status to the canonical OpenAI error type.
fn client_error_type(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        _ => "invalid_request_error",
    }
}

/// Resolve (status, type, client-visible message) for an error.
fn classify(error: &Error, expose_upstream: bool) -> (StatusCode, &'static str, String) {
    match error {
        Error::InvalidRequest(message) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message.clone(),
        ),
        Error::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "Invalid or missing API key".to_string(),
        ),
        Error::BodyTooLarge { size, max } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            format!("Request body of {size} bytes exceeds the {max} byte limit"),
        ),
        Error::RateLimited {
            provider,
            retry_after_secs,
            ..
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            format!("Rate limit exceeded for {provider}; retry after {retry_after_secs}s"),
        ),
        Error::NoProviderAvailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "No provider is currently available for this request".to_string(),
        ),
        Error::DeadlineExceeded { .. } | Error::Cancelled => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout_error",
            "The request did not complete before the deadline".to_string(),
        ),
        Error::AllProvidersFailed { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "All upstream providers failed for this request".to_string(),
        ),
        Error::Upstream {
            status, message, ..
        } => {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let visible = if expose_upstream {
                message.clone()
            } else {
                GENERIC_UPSTREAM_MESSAGE.to_string()
            };
            if (400..500).contains(status) {
                (code, client_error_type(*status), visible)
            } else {
                (code, "api_error", visible)
            }
        }
        Error::Network { .. } => (
            StatusCode::BAD_GATEWAY,
            "api_error",
            GENERIC_UPSTREAM_MESSAGE.to_string(),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "An internal error occurred".to_string(),
        ),
    }
}

/// Build the terminal error response. Logs the full error; the client gets
/// the scrubbed envelope.
pub fn error_response(error: &Error, expose_upstream: bool) -> Response {
    let (status, error_type, message) = classify(error, expose_upstream);
    if status.is_server_error() {
        tracing::warn!(error = %error, status = status.as_u16(), "request failed");
    } else {
        tracing::debug!(error = %error, status = status.as_u16(), "request rejected");
    }

    let mut body = json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": status.as_u16(),
        }
    });
    if let Some(provider) = error.provider() {
        body["error"]["provider"] = json!(provider);
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use polygate_core::{AttemptRecord, ProviderId};

    fn body_of(response: Response) -> serde_json::Value {
        let (_, body) = response.into_parts();
        let bytes = futures::executor::block_on(axum::body::to_bytes(body, usize::MAX)).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_invalid_request_is_400() {
        let response = error_response(&Error::InvalidRequest("bad".to_string()), false);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_of(response);
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "bad");
    }

    #[test]
    fn test_unauthorized_is_401() {
        let response = error_response(&Error::Unauthorized, false);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_of(response)["error"]["type"], "authentication_error");
    }

    #[test]
    fn test_deadline_is_504_timeout() {
        let response = error_response(&Error::DeadlineExceeded { attempts: vec![] }, false);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_of(response)["error"]["type"], "timeout_error");
    }

    #[test]
    fn test_all_providers_failed_is_503() {
        let attempts = vec![AttemptRecord {
            provider: ProviderId::OpenAi,
            model: "gpt-4o".to_string(),
            latency_ms: 5,
            error: Some("503".to_string()),
        }];
        let response = error_response(&Error::AllProvidersFailed { attempts }, false);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_of(response)["error"]["type"], "server_error");
    }

    #[test]
    fn test_upstream_4xx_mapped_by_status() {
        let error = Error::Upstream {
            provider: ProviderId::Anthropic,
            status: 404,
            message: "model not found at https://internal".to_string(),
        };
        let response = error_response(&error, false);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_of(response);
        assert_eq!(body["error"]["type"], "not_found_error");
        assert_eq!(body["error"]["provider"], "anthropic");
        // Scrubbed in production mode.
        assert_eq!(body["error"]["message"], GENERIC_UPSTREAM_MESSAGE);
    }

    #[test]
    fn test_upstream_message_exposed_when_opted_in() {
        let error = Error::Upstream {
            provider: ProviderId::OpenAi,
            status: 500,
            message: "internal details".to_string(),
        };
        let body = body_of(error_response(&error, true));
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["message"], "internal details");
    }

    #[test]
    fn test_network_error_is_502_api_error() {
        let error = Error::Network {
            provider: ProviderId::Google,
            message: "connection refused to 10.0.0.3".to_string(),
        };
        let response = error_response(&error, false);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_of(response);
        assert_eq!(body["error"]["type"], "api_error");
        // Endpoint details never leak.
        assert_eq!(body["error"]["message"], GENERIC_UPSTREAM_MESSAGE);
    }

    #[test]
    fn test_unknown_error_is_500_internal() {
        let response = error_response(&Error::Internal("boom".to_string()), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response)["error"]["type"], "internal_error");
    }
}
