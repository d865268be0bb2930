//! # Error Envelope
//!
//! Maps classified core errors onto the public JSON envelope
//! `{"error": {"code", "message", "details"}}` with a stable code set and
//! the HTTP status mapping of the API contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llm_gateway_core::error::{ClassifiedError, ErrorCategory};
use serde::Serialize;
use serde_json::json;

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    InvalidRequest,
    ProviderUnavailable,
    ProviderTimeout,
    RateLimited,
    QuotaExceeded,
    RoutingFailed,
    InternalServerError,
}

#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::InvalidRequest,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::InternalServerError,
            message: message.into(),
            details: None,
        }
    }

    /// The JSON envelope body, shared by buffered responses and SSE error
    /// frames.
    pub fn envelope(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        json!({ "error": error })
    }
}

impl From<ClassifiedError> for GatewayError {
    fn from(err: ClassifiedError) -> Self {
        let (status, code) = match err.category {
            ErrorCategory::Auth => (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
            ErrorCategory::Client => (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest),
            ErrorCategory::Quota => (StatusCode::PAYMENT_REQUIRED, ErrorCode::QuotaExceeded),
            ErrorCategory::RateLimit => (StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited),
            ErrorCategory::Timeout => (StatusCode::GATEWAY_TIMEOUT, ErrorCode::ProviderTimeout),
            ErrorCategory::Network | ErrorCategory::Server => {
                if err.operation == "routing" {
                    if err.message.contains("no available provider") {
                        (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::ProviderUnavailable)
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::RoutingFailed)
                    }
                } else {
                    (StatusCode::BAD_GATEWAY, ErrorCode::ProviderUnavailable)
                }
            }
        };

        Self {
            status,
            code,
            message: err.message.clone(),
            details: Some(json!({
                "provider": err.provider,
                "operation": err.operation,
                "category": err.category.as_str(),
            })),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = self.envelope();
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_to_status_mapping() {
        let cases = [
            (ErrorCategory::Auth, StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
            (ErrorCategory::Client, StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest),
            (ErrorCategory::Quota, StatusCode::PAYMENT_REQUIRED, ErrorCode::QuotaExceeded),
            (ErrorCategory::RateLimit, StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited),
            (ErrorCategory::Timeout, StatusCode::GATEWAY_TIMEOUT, ErrorCode::ProviderTimeout),
            (ErrorCategory::Server, StatusCode::BAD_GATEWAY, ErrorCode::ProviderUnavailable),
        ];
        for (category, status, code) in cases {
            let err = GatewayError::from(ClassifiedError::new(category, "p", "chat", "m"));
            assert_eq!(err.status, status, "{category:?}");
            assert_eq!(err.code, code, "{category:?}");
        }
    }

    #[test]
    fn routing_exhaustion_is_503() {
        let mut core = ClassifiedError::new(
            ErrorCategory::Server,
            "router",
            "routing",
            "no available provider for this request",
        );
        core.status = Some(503);
        let err = GatewayError::from(core);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, ErrorCode::ProviderUnavailable);

        let skipped = GatewayError::from(ClassifiedError::new(
            ErrorCategory::Server,
            "router",
            "routing",
            "all candidate providers skipped by open circuit breakers",
        ));
        assert_eq!(skipped.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(skipped.code, ErrorCode::RoutingFailed);
    }

    #[test]
    fn envelope_shape() {
        let err = GatewayError::invalid_request("model is required");
        let body = err.envelope();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert_eq!(body["error"]["message"], "model is required");
    }
}
