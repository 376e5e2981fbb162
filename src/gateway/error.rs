use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::admission::RateDecision;
use crate::storage::StoreError;

/// Failures of a gateway request, each mapped to one HTTP status
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests to {domain}")]
    RateLimited {
        domain: String,
        retry_after: u64,
        limit: u64,
        remaining: u64,
        window_seconds: u64,
    },

    #[error("Failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        status_code: Option<u16>,
        message: String,
    },

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0} not enabled")]
    Disabled(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Denial built from a rate-limit decision
    pub fn rate_limited(decision: &RateDecision) -> Self {
        GatewayError::RateLimited {
            domain: decision.domain.clone(),
            retry_after: decision.retry_after.unwrap_or(decision.window_seconds).max(1),
            limit: decision.max_requests,
            remaining: decision.remaining,
            window_seconds: decision.window_seconds,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Fetch { .. }
            | GatewayError::Processing(_)
            | GatewayError::Store(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            GatewayError::RateLimited {
                ref domain,
                retry_after,
                limit,
                remaining,
                window_seconds,
            } => {
                let body = json!({
                    "error": "Rate limit exceeded",
                    "message": format!("Too many requests to {}", domain),
                    "rate_limit": {
                        "limit": limit,
                        "window_seconds": window_seconds,
                        "retry_after": retry_after,
                    },
                });

                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                response
            }
            GatewayError::Fetch {
                ref url,
                status_code,
                ref message,
            } => {
                let body = json!({
                    "error": "Failed to fetch URL",
                    "url": url,
                    "status_code": status_code,
                    "details": message,
                });
                (status, Json(body)).into_response()
            }
            GatewayError::BadRequest(message) => (status, Json(json!({ "error": message }))).into_response(),
            GatewayError::Disabled(what) => {
                (status, Json(json!({ "error": format!("{} not enabled", what) }))).into_response()
            }
            other => {
                let body = json!({
                    "error": "Internal server error",
                    "details": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_headers() {
        let decision = RateDecision {
            domain: "example.com".to_string(),
            allowed: false,
            requests_in_window: 10,
            max_requests: 10,
            window_seconds: 60,
            remaining: 0,
            retry_after: Some(7),
        };

        let response = GatewayError::rate_limited(&decision).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::BadRequest("no url".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::Disabled("Cache").status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::Fetch {
                url: "https://example.com".into(),
                status_code: None,
                message: "timed out".into(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayError::Disabled("Cache").to_string(), "Cache not enabled");
    }
}
