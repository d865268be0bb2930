//! # Error Classification
//!
//! Every failure that crosses an adapter boundary is converted into a
//! [`ClassifiedError`]: a category, the HTTP status when one exists, the
//! provider and operation it came from, and a retryability verdict the retry
//! layer and circuit breaker act on.
//!
//! ## Categories and retryability
//!
//! | Category | Retryable | Typical source |
//! |---|---|---|
//! | `auth` | no | 401/403, invalid credential |
//! | `client` | no | 4xx, malformed request, unsupported model |
//! | `quota` | no | 402, billing exhausted |
//! | `rate_limit` | yes | 429, `Retry-After` honored |
//! | `timeout` | yes | local deadline or upstream stall |
//! | `network` | yes | socket, DNS, TLS |
//! | `server` | yes | upstream 5xx |
//!
//! Classification is idempotent: classifying an already-classified error
//! returns the same classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Category of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Quota,
    Network,
    Server,
    Client,
    Timeout,
}

impl ErrorCategory {
    /// Default retryability verdict for the category. Unknown or
    /// non-transient categories are never retried.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Server
                | ErrorCategory::Timeout
        )
    }

    /// Whether failures of this category count toward a provider's circuit
    /// breaker. Policy refusals (`quota`) and caller mistakes (`auth`,
    /// `client`) do not; `rate_limit` contributes only once retries are
    /// exhausted, which the router handles separately.
    pub fn counts_toward_breaker(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Server | ErrorCategory::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Network => "network",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

/// An error classified against the common schema shared by all adapters.
#[derive(Debug, Error)]
#[error("{} error from {provider} during {operation}: {message}", .category.as_str())]
pub struct ClassifiedError {
    /// Failure category
    pub category: ErrorCategory,
    /// HTTP status, when the failure came from an HTTP response
    pub status: Option<u16>,
    /// Provider the failure is attributed to
    pub provider: String,
    /// Operation tag, e.g. `chat`, `chat_stream`, `health_probe`, `routing`
    pub operation: String,
    /// Human-readable message
    pub message: String,
    /// Whether the retry layer may attempt this operation again
    pub retryable: bool,
    /// Explicit upstream backoff hint, from a `Retry-After` header or a
    /// platform error table
    pub retry_after: Option<Duration>,
    /// Wrapped cause
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    pub fn new(
        category: ErrorCategory,
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            status: None,
            provider: provider.into(),
            operation: operation.into(),
            message: message.into(),
            retryable: category.retryable(),
            retry_after: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Classify an HTTP status code per the shared mapping: 401/403 are
    /// `auth`, 402 `quota`, 429 `rate_limit`, other 4xx `client`, 5xx
    /// `server`.
    pub fn from_status(
        status: u16,
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let category = category_for_status(status);
        let mut err = Self::new(category, provider, operation, message).with_status(status);
        if category == ErrorCategory::RateLimit {
            err.retry_after = retry_after.or(Some(DEFAULT_RATE_LIMIT_RETRY_AFTER));
        }
        err
    }

    /// Classify a platform error code from a Baidu-style (or Zhipu-style)
    /// error body. Unknown codes default to a non-retryable `client` error.
    pub fn from_platform_code(
        code: i64,
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        match code {
            1001 | 1002 => Self::new(ErrorCategory::Auth, provider, operation, message),
            1003 | 1004 => Self::new(ErrorCategory::Client, provider, operation, message),
            1013 => Self::new(ErrorCategory::RateLimit, provider, operation, message)
                .with_retry_after(DEFAULT_RATE_LIMIT_RETRY_AFTER),
            1301 | 1302 | 50001 | 50002 => {
                Self::new(ErrorCategory::Server, provider, operation, message)
            }
            _ => {
                let mut err = Self::new(ErrorCategory::Client, provider, operation, message);
                err.retryable = false;
                err
            }
        }
    }

    /// Classify a transport-level failure from the HTTP client. Deadline
    /// expiry maps to `timeout`, everything else to `network`.
    pub fn from_transport(
        err: reqwest::Error,
        provider: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        let category = if err.is_timeout() {
            ErrorCategory::Timeout
        } else {
            ErrorCategory::Network
        };
        let message = err.to_string();
        Self::new(category, provider, operation, message).with_source(err)
    }

    /// Terminal result for a cancelled context. Network-class by convention,
    /// but never retried.
    pub fn cancelled(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::Network, provider, operation, "context cancelled");
        err.retryable = false;
        err
    }

    /// Malformed upstream payload.
    pub fn invalid_response(
        provider: impl Into<String>,
        operation: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Self::new(ErrorCategory::Server, provider, operation, "invalid upstream response body")
            .with_source(source)
    }
}

/// Fallback backoff applied to rate-limit errors that carry no explicit
/// `Retry-After`.
pub const DEFAULT_RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(60);

fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        402 => ErrorCategory::Quota,
        429 => ErrorCategory::RateLimit,
        400..=499 => ErrorCategory::Client,
        _ => ErrorCategory::Server,
    }
}

/// Classification entry point for errors that may already be classified.
/// Idempotent by construction: a [`ClassifiedError`] passes through
/// unchanged.
pub fn classify(err: ClassifiedError) -> ClassifiedError {
    err
}
