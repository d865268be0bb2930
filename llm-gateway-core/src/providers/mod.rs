//! # Provider Adapter Layer
//!
//! Adapters hide upstream heterogeneity behind one interface: translate the
//! normalized request into each provider's native wire shape, decode buffered
//! and streamed responses, classify failures against the common schema, and
//! expose health probing, cost estimation and rate-limit snapshots.
//!
//! ## Supported providers
//!
//! - **OpenAI**: pass-through message list, Bearer auth
//! - **Anthropic**: system messages lifted into a dedicated field,
//!   `x-api-key` + `anthropic-version` headers, mandatory `max_tokens`
//! - **Baidu Wenxin**: OAuth access token with single-flight refresh,
//!   per-model endpoint sub-paths
//! - **Zhipu GLM**: OpenAI-shaped surface on Zhipu's paas endpoint
//! - **Mock**: scripted adapter used by routing tests and smoke deployments
//!
//! ## Streaming contract
//!
//! [`Provider::invoke_stream`] drives a caller-supplied [`StreamHandler`]
//! callback. Chunks are delivered in arrival order; `done = true` is emitted
//! exactly once and is always the last invocation. On cancellation the
//! adapter closes the upstream connection and returns a `network`-class
//! error without emitting further chunks.

use crate::error::ClassifiedError;
use crate::estimator::CostEstimate;
use crate::models::{
    ChatRequest, ChatResponse, ModelDescriptor, ProbeResult, RateLimitSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod anthropic;
pub mod baidu;
pub mod http_client;
pub mod mock;
pub mod openai;
pub mod sse;
pub mod zhipu;

/// Push callback for streamed responses: `(chunk_text, done)`.
///
/// `done = true` signals terminal delivery; all content has already been
/// emitted by the time it fires.
pub type StreamHandler<'a> = &'a mut (dyn FnMut(&str, bool) + Send);

/// Provider type tag, selecting the wire dialect an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Baidu,
    Zhipu,
    Mock,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Openai => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Baidu => "baidu",
            ProviderType::Zhipu => "zhipu",
            ProviderType::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderType::Openai),
            "anthropic" => Ok(ProviderType::Anthropic),
            "baidu" => Ok(ProviderType::Baidu),
            "zhipu" => Ok(ProviderType::Zhipu),
            "mock" => Ok(ProviderType::Mock),
            other => Err(format!("unknown provider type: {other}")),
        }
    }
}

/// Static capability descriptor. Absence of a capability is signaled here,
/// never by returning an error from the corresponding operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the upstream supports streamed responses
    pub streaming: bool,
    /// Whether the upstream reports token usage in responses
    pub reports_usage: bool,
    /// Whether the upstream publishes rate-limit headers
    pub rate_limit_headers: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { streaming: true, reports_usage: true, rate_limit_headers: false }
    }
}

/// Declared upstream rate limits from configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum requests allowed per minute
    pub requests_per_minute: u32,
    /// Maximum tokens allowed per minute
    pub tokens_per_minute: u32,
}

/// Validated configuration for a provider instance.
///
/// Credential material is deliberately excluded from serialization: a
/// serialized config never carries the key it was constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Globally unique provider name
    pub name: String,
    /// Wire dialect
    pub provider_type: ProviderType,
    /// API key or client id, resolved through the secure-config facade
    #[serde(skip_serializing, default)]
    pub api_key: String,
    /// Override for the provider's default base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Routing weight; defaults to 100 when unset
    pub weight: u32,
    /// Request timeout for the provider's HTTP client
    pub timeout: Duration,
    /// Declared upstream rate limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Models this provider serves; empty means "accept any"
    pub models: Vec<String>,
    /// Provider-specific extras (e.g. the Baidu `client_secret`)
    #[serde(skip_serializing, default)]
    pub extra: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, provider_type: ProviderType, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type,
            api_key: api_key.into(),
            base_url: None,
            weight: 100,
            timeout: Duration::from_secs(30),
            rate_limit: None,
            models: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Unified interface every provider adapter implements.
///
/// Adapters are responsible for setting `provider` on every response to
/// their own name, copying usage verbatim when the upstream reports it and
/// estimating it otherwise, and leaving `latency_ms` at zero for the router
/// to fill.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Globally unique provider name.
    fn name(&self) -> &str;

    /// Wire dialect tag.
    fn provider_type(&self) -> ProviderType;

    /// Static capability descriptor.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Routing weight from configuration.
    fn weight(&self) -> u32;

    /// Models this provider serves; empty means "accept any".
    fn supported_models(&self) -> Vec<String>;

    /// Declared rate limits from configuration.
    fn rate_limit_config(&self) -> Option<RateLimit>;

    /// Buffered chat completion.
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, ClassifiedError>;

    /// Streamed chat completion driving the `emit` callback; see the module
    /// docs for the ordering and cancellation contract.
    async fn invoke_stream(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<(), ClassifiedError>;

    /// Lightweight reachability probe against the provider endpoint.
    async fn health_probe(&self, ctx: &CancellationToken) -> ProbeResult;

    /// Pre-flight cost estimate for a request.
    fn estimate_cost(&self, request: &ChatRequest) -> CostEstimate {
        crate::estimator::estimate_cost(request, self.provider_type())
    }

    /// Models served by this provider, as descriptors.
    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.supported_models()
            .into_iter()
            .map(|name| ModelDescriptor { name, provider: self.name().to_string() })
            .collect()
    }

    /// Advisory rate-limit view, refreshed from upstream response headers.
    fn rate_limit_snapshot(&self) -> RateLimitSnapshot;
}

/// Create a provider instance from validated configuration.
pub fn create_provider(config: ProviderConfig) -> Result<Arc<dyn Provider>, ClassifiedError> {
    match config.provider_type {
        ProviderType::Openai => Ok(Arc::new(openai::OpenAiProvider::new(config)?)),
        ProviderType::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::new(config)?)),
        ProviderType::Baidu => Ok(Arc::new(baidu::BaiduProvider::new(config)?)),
        ProviderType::Zhipu => Ok(Arc::new(zhipu::ZhipuProvider::new(config)?)),
        ProviderType::Mock => Ok(Arc::new(mock::MockProvider::from_config(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_type_parses_and_displays() {
        for tag in ["openai", "anthropic", "baidu", "zhipu", "mock"] {
            let parsed: ProviderType = tag.parse().unwrap();
            assert_eq!(parsed.to_string(), tag);
        }
        assert!("gemini".parse::<ProviderType>().is_err());
    }

    #[test]
    fn credentials_never_serialize() {
        let config = ProviderConfig::new("prod-openai", ProviderType::Openai, "sk-secret")
            .with_extra("client_secret", "also-secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("also-secret"));
        assert!(json.contains("prod-openai"));
    }
}
