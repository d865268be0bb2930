//! Shared HTTP plumbing for provider adapters: a pooled `reqwest` client per
//! adapter, auth strategies, cancellation-aware request helpers, error-body
//! classification and rate-limit header parsing.

use crate::error::ClassifiedError;
use crate::models::RateLimitSnapshot;
use crate::providers::RateLimit;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an adapter authenticates against its upstream.
#[derive(Clone, Debug)]
pub enum AuthStrategy {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// A named header, e.g. `x-api-key`
    Header { name: String, value: String },
    /// No static auth; credentials are supplied per request (Baidu's
    /// access-token query parameter)
    None,
}

/// Pooled HTTP client bound to one provider endpoint.
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
    provider: String,
    rate: RateLimitTracker,
}

impl HttpProviderClient {
    pub fn new(
        provider: &str,
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
        declared_limit: Option<RateLimit>,
    ) -> Result<Self, ClassifiedError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("LLM-Gateway/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ClassifiedError::new(
                    crate::error::ErrorCategory::Client,
                    provider,
                    "init",
                    format!("failed to build HTTP client: {e}"),
                )
            })?;

        let mut default_headers = HeaderMap::new();
        match auth {
            AuthStrategy::Bearer { token } => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    default_headers.insert("Authorization", value);
                }
            }
            AuthStrategy::Header { name, value } => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<reqwest::header::HeaderName>(), value.parse())
                {
                    default_headers.insert(name, value);
                }
            }
            AuthStrategy::None => {}
        }
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| default_base.to_string()),
            default_headers,
            provider: provider.to_string(),
            rate: RateLimitTracker::new(declared_limit),
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    /// POST a JSON body and decode a JSON response, classifying failures.
    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
        body: &TReq,
    ) -> Result<TResp, ClassifiedError> {
        let resp = self.post_raw(ctx, operation, path, query, body).await?;
        if !resp.status().is_success() {
            return Err(self.classify_response(operation, resp).await);
        }
        let bytes = tokio::select! {
            _ = ctx.cancelled() => return Err(ClassifiedError::cancelled(&self.provider, operation)),
            bytes = resp.bytes() => bytes
                .map_err(|e| ClassifiedError::from_transport(e, &self.provider, operation))?,
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| ClassifiedError::invalid_response(&self.provider, operation, e))
    }

    /// POST a JSON body and hand back the raw response, for streaming
    /// decoders. The status is not checked here.
    pub async fn post_raw<TReq: Serialize>(
        &self,
        ctx: &CancellationToken,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
        body: &TReq,
    ) -> Result<Response, ClassifiedError> {
        let url = self.build_url(path);
        let mut builder = self
            .http
            .post(url)
            .headers(self.default_headers.clone())
            .json(body);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let resp = tokio::select! {
            _ = ctx.cancelled() => return Err(ClassifiedError::cancelled(&self.provider, operation)),
            resp = builder.send() => resp
                .map_err(|e| ClassifiedError::from_transport(e, &self.provider, operation))?,
        };
        self.rate.observe(resp.headers());
        Ok(resp)
    }

    /// GET and decode a JSON response.
    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        operation: &str,
        path: &str,
    ) -> Result<TResp, ClassifiedError> {
        let url = self.build_url(path);
        let builder = self.http.get(url).headers(self.default_headers.clone());
        let resp = tokio::select! {
            _ = ctx.cancelled() => return Err(ClassifiedError::cancelled(&self.provider, operation)),
            resp = builder.send() => resp
                .map_err(|e| ClassifiedError::from_transport(e, &self.provider, operation))?,
        };
        self.rate.observe(resp.headers());
        if !resp.status().is_success() {
            return Err(self.classify_response(operation, resp).await);
        }
        let bytes = tokio::select! {
            _ = ctx.cancelled() => return Err(ClassifiedError::cancelled(&self.provider, operation)),
            bytes = resp.bytes() => bytes
                .map_err(|e| ClassifiedError::from_transport(e, &self.provider, operation))?,
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| ClassifiedError::invalid_response(&self.provider, operation, e))
    }

    /// Classify a non-success HTTP response into the common error schema,
    /// pulling a message out of the usual JSON error shapes and honoring
    /// `Retry-After` on 429s.
    pub async fn classify_response(&self, operation: &str, resp: Response) -> ClassifiedError {
        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        let message = extract_error_message(&body).unwrap_or_else(|| {
            if body.is_empty() {
                format!("upstream returned status {status}")
            } else {
                body.clone()
            }
        });
        ClassifiedError::from_status(status, &self.provider, operation, message, retry_after)
    }

    /// Current advisory rate-limit snapshot.
    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.rate.snapshot()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Pull a human message out of the common upstream error shapes:
/// `{"error": {"message": ...}}`, `{"error_msg": ...}`, `{"message": ...}`.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("error_msg"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Tracks the advisory rate-limit view parsed from upstream response
/// headers. Writers hold the mutex only to copy a few integers.
pub struct RateLimitTracker {
    declared: Option<RateLimit>,
    observed: Mutex<Observed>,
}

#[derive(Default, Clone)]
struct Observed {
    remaining_rpm: Option<u32>,
    remaining_tpm: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
}

/// Header names checked for remaining-request budgets, in order.
const REMAINING_REQUEST_HEADERS: &[&str] = &[
    "x-ratelimit-remaining-requests",
    "anthropic-ratelimit-requests-remaining",
];

/// Header names checked for remaining-token budgets, in order.
const REMAINING_TOKEN_HEADERS: &[&str] = &[
    "x-ratelimit-remaining-tokens",
    "anthropic-ratelimit-tokens-remaining",
];

/// Header names checked for window-reset timestamps, in order.
const RESET_HEADERS: &[&str] = &[
    "anthropic-ratelimit-requests-reset",
    "x-ratelimit-reset-requests",
];

impl RateLimitTracker {
    pub fn new(declared: Option<RateLimit>) -> Self {
        Self { declared, observed: Mutex::new(Observed::default()) }
    }

    /// Fold the rate-limit headers of a response into the snapshot.
    pub fn observe(&self, headers: &HeaderMap) {
        let remaining_rpm = first_numeric_header(headers, REMAINING_REQUEST_HEADERS);
        let remaining_tpm = first_numeric_header(headers, REMAINING_TOKEN_HEADERS);
        let reset_at = RESET_HEADERS.iter().find_map(|name| {
            headers
                .get(*name)?
                .to_str()
                .ok()?
                .parse::<DateTime<Utc>>()
                .ok()
        });

        if remaining_rpm.is_none() && remaining_tpm.is_none() && reset_at.is_none() {
            return;
        }
        let mut observed = self.observed.lock().unwrap();
        if remaining_rpm.is_some() {
            observed.remaining_rpm = remaining_rpm;
        }
        if remaining_tpm.is_some() {
            observed.remaining_tpm = remaining_tpm;
        }
        if reset_at.is_some() {
            observed.reset_at = reset_at;
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let observed = self.observed.lock().unwrap().clone();
        let declared = self.declared.unwrap_or_default();
        RateLimitSnapshot {
            rpm: declared.requests_per_minute,
            tpm: declared.tokens_per_minute,
            remaining_rpm: observed.remaining_rpm,
            remaining_tpm: observed.remaining_tpm,
            reset_at: observed.reset_at,
        }
    }
}

fn first_numeric_header(headers: &HeaderMap, names: &[&str]) -> Option<u32> {
    names
        .iter()
        .find_map(|name| headers.get(*name)?.to_str().ok()?.trim().parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn error_message_extraction_handles_common_shapes() {
        assert_eq!(
            extract_error_message(r#"{"error": {"message": "bad key"}}"#),
            Some("bad key".to_string())
        );
        assert_eq!(
            extract_error_message(r#"{"error_msg": "qps limit"}"#),
            Some("qps limit".to_string())
        );
        assert_eq!(extract_error_message("not json"), None);
    }

    #[test]
    fn tracker_folds_headers_and_keeps_declared_limits() {
        let tracker = RateLimitTracker::new(Some(RateLimit {
            requests_per_minute: 600,
            tokens_per_minute: 90_000,
        }));

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-requests",
            HeaderValue::from_static("42"),
        );
        tracker.observe(&headers);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.rpm, 600);
        assert_eq!(snapshot.tpm, 90_000);
        assert_eq!(snapshot.remaining_rpm, Some(42));
        assert_eq!(snapshot.remaining_tpm, None);

        // A later response without headers does not erase what we know.
        tracker.observe(&HeaderMap::new());
        assert_eq!(tracker.snapshot().remaining_rpm, Some(42));

        let mut anthropic = HeaderMap::new();
        anthropic.insert(
            "anthropic-ratelimit-tokens-remaining",
            HeaderValue::from_static("88000"),
        );
        tracker.observe(&anthropic);
        assert_eq!(tracker.snapshot().remaining_tpm, Some(88_000));
    }
}
