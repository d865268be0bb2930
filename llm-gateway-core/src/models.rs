//! # Normalized Chat Types
//!
//! This module defines the provider-neutral data model that flows through the
//! gateway. Incoming OpenAI-compatible requests are deserialized into
//! [`ChatRequest`], translated by an adapter into the upstream wire shape, and
//! the upstream reply is translated back into a [`ChatResponse`].
//!
//! ## Normalization rules
//!
//! - Every response carries the **name of the provider** that produced it.
//! - `usage` is copied verbatim when the upstream reports it; otherwise the
//!   adapter estimates completion tokens from the emitted content.
//! - `latency_ms` is always written by the router, never by an adapter.
//!
//! ## Streaming
//!
//! Adapters stream plain text deltas through a push callback (see
//! [`crate::providers::StreamHandler`]); the [`StreamChunk`] envelope defined
//! here is the JSON shape the HTTP front-end frames into SSE events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat completion request, normalized across providers.
///
/// # Example
///
/// ```rust
/// let request = ChatRequest {
///     model: "gpt-4".to_string(),
///     messages: vec![Message::user("Hello, world!")],
///     temperature: Some(0.7),
///     max_tokens: Some(100),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Opaque request identifier; generated by the front-end when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The model to use for completion
    pub model: String,
    /// Ordered conversation messages
    pub messages: Vec<Message>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Controls randomness (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling cutoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Reduces repetition of topics already present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Reduces repetition of tokens already present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Sequences that stop generation; a bare string or a list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Opaque user tag, used for sticky routing and upstream attribution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    /// Content of the first message, used as part of the consistent-hash key.
    pub fn first_message_content(&self) -> &str {
        self.messages.first().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// Whether the conversation contains at least one system message.
    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }
}

/// Stop sequences accepted either as a single string or a list of strings,
/// mirroring the OpenAI surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Many(Vec<String>),
}

impl StopSequences {
    /// Normalize to a list regardless of the accepted shape.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequences::Single(s) => vec![s.clone()],
            StopSequences::Many(v) => v.clone(),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Chat completion response, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Identifier echoed from the request or assigned by the upstream
    pub id: String,
    /// Echoed model name
    pub model: String,
    /// Name of the provider that produced this response
    pub provider: String,
    /// Unix timestamp of creation
    pub created: u64,
    /// Generated completions
    pub choices: Vec<Choice>,
    /// Token usage, reported by the upstream or estimated
    pub usage: Usage,
    /// End-to-end latency measured by the router; adapters leave this at zero
    #[serde(default)]
    pub latency_ms: u64,
}

/// A generated completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Index of the choice in the response
    pub index: u32,
    /// The generated message
    pub message: Message,
    /// Reason why generation stopped; `None` while still streaming
    pub finish_reason: Option<FinishReason>,
}

/// Reason a completion stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Tool,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }
}

/// Incremental frame of a streamed response. The JSON shape matches the
/// non-streaming [`ChatResponse`] with a `delta` per choice; the terminal
/// frame carries `done: true` and an empty delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub created: u64,
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Descriptor for a model a provider can serve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Model name as accepted in requests
    pub name: String,
    /// Name of the provider that serves it
    pub provider: String,
}

/// Record of a routing decision, returned alongside every dispatched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Name of the selected provider
    pub provider: String,
    /// Name of the strategy that made the choice
    pub strategy: String,
    /// Attempt number on which the request completed (starts at 1)
    pub attempt: u32,
    /// Whether a backup path was taken (degraded candidate list or a
    /// breaker-open provider was skipped)
    pub used_backup: bool,
    /// In-flight requests divided by the provider's rpm limit, in [0, 1]
    pub load_factor: f64,
    /// Wall-clock time of the selection
    pub selected_at: DateTime<Utc>,
}

/// Advisory view of a provider's upstream rate-limit budget, refreshed from
/// response headers after every call. The router may use it to bias
/// selection but never treats it as authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Declared requests-per-minute limit from configuration
    pub rpm: u32,
    /// Declared tokens-per-minute limit from configuration
    pub tpm: u32,
    /// Remaining requests reported by the upstream, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_rpm: Option<u32>,
    /// Remaining tokens reported by the upstream, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_tpm: Option<u32>,
    /// When the upstream window resets, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

/// Result of a single health probe against a provider endpoint.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    /// Round-trip time of the probe
    pub rtt: Duration,
    /// Endpoint that was probed
    pub endpoint: String,
    /// Error description when the probe failed
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(rtt: Duration, endpoint: impl Into<String>) -> Self {
        Self { healthy: true, rtt, endpoint: endpoint.into(), error: None }
    }

    pub fn failed(rtt: Duration, endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self { healthy: false, rtt, endpoint: endpoint.into(), error: Some(error.into()) }
    }
}
