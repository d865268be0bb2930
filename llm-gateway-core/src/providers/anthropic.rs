//! Anthropic adapter. System messages are extracted from the conversation
//! and concatenated into the dedicated top-level `system` field, `max_tokens`
//! is mandatory on the wire (defaulted when the caller omits it), and `stop`
//! is lifted into `stop_sequences`.

use crate::error::ClassifiedError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, FinishReason, Message, ProbeResult, RateLimitSnapshot,
    Role, Usage,
};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::openai::estimated_usage;
use crate::providers::sse::{data_payload, SseLineBuffer};
use crate::providers::{
    Capabilities, Provider, ProviderConfig, ProviderType, RateLimit, StreamHandler,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Applied when the caller omits `max_tokens`; the upstream rejects
/// requests without one.
const DEFAULT_MAX_TOKENS: u32 = 1000;

const OP_CHAT: &str = "chat";
const OP_CHAT_STREAM: &str = "chat_stream";
const OP_HEALTH: &str = "health_probe";

pub struct AnthropicProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamEventDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamEventDelta {
    #[serde(default)]
    text: Option<String>,
}

fn finish_reason_from_stop(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("end_turn") | Some("stop_sequence") => Some(FinishReason::Stop),
        Some("max_tokens") => Some(FinishReason::Length),
        Some("tool_use") => Some(FinishReason::Tool),
        _ => None,
    }
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ClassifiedError> {
        let mut headers = HashMap::new();
        headers.insert("anthropic-version".to_string(), API_VERSION.to_string());
        let http = HttpProviderClient::new(
            &config.name,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE,
            &headers,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: config.api_key.clone(),
            },
            config.rate_limit,
        )?;
        Ok(Self { http, config })
    }

    fn to_wire(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !message.content.is_empty() {
                        system_parts.push(message.content.clone());
                    }
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                Role::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                }),
                Role::Tool => {}
            }
        }

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n"))
            },
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop.as_ref().map(|s| s.to_vec()),
            stream: stream.then_some(true),
        }
    }

    fn convert_response(&self, request: &ChatRequest, response: AnthropicResponse) -> ChatResponse {
        let content = response
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        let choices = vec![Choice {
            index: 0,
            message: Message::assistant(content),
            finish_reason: finish_reason_from_stop(response.stop_reason.as_deref()),
        }];

        let usage = match response.usage {
            Some(u) => Usage::new(u.input_tokens, u.output_tokens),
            None => estimated_usage(request, &choices, self.provider_type()),
        };

        ChatResponse {
            id: response.id,
            model: response.model,
            provider: self.config.name.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            choices,
            usage,
            latency_ms: 0,
        }
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { streaming: true, reports_usage: true, rate_limit_headers: true }
    }

    fn weight(&self) -> u32 {
        self.config.weight
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.models.clone()
    }

    fn rate_limit_config(&self) -> Option<RateLimit> {
        self.config.rate_limit
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, ClassifiedError> {
        let wire = self.to_wire(&request, false);
        let response: AnthropicResponse =
            self.http.post_json(ctx, OP_CHAT, MESSAGES_PATH, &[], &wire).await?;
        Ok(self.convert_response(&request, response))
    }

    async fn invoke_stream(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<(), ClassifiedError> {
        let wire = self.to_wire(&request, true);
        let resp = self
            .http
            .post_raw(ctx, OP_CHAT_STREAM, MESSAGES_PATH, &[], &wire)
            .await?;
        if !resp.status().is_success() {
            return Err(self.http.classify_response(OP_CHAT_STREAM, resp).await);
        }

        let mut body = resp.bytes_stream();
        let mut lines = SseLineBuffer::new();
        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(ClassifiedError::cancelled(self.name(), OP_CHAT_STREAM));
                }
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk
                .map_err(|e| ClassifiedError::from_transport(e, self.name(), OP_CHAT_STREAM))?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                let Some(payload) = data_payload(&line) else { continue };
                let event: StreamEvent = match serde_json::from_str(payload) {
                    Ok(event) => event,
                    // Anthropic interleaves ping and metadata events; skip
                    // anything that does not parse as a known event shape.
                    Err(_) => continue,
                };
                match event.event_type.as_str() {
                    "content_block_delta" => {
                        if let Some(text) = event.delta.and_then(|d| d.text) {
                            if !text.is_empty() {
                                emit(&text, false);
                            }
                        }
                    }
                    "message_stop" => {
                        emit("", true);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        emit("", true);
        Ok(())
    }

    async fn health_probe(&self, ctx: &CancellationToken) -> ProbeResult {
        let endpoint = format!("{}{}", self.http.base_url(), MESSAGES_PATH);
        // No dedicated health endpoint upstream; a one-token completion is
        // the cheapest authenticated round trip.
        let probe = AnthropicRequest {
            model: self
                .config
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| "claude-3-haiku".to_string()),
            max_tokens: 1,
            messages: vec![AnthropicMessage { role: "user".to_string(), content: "Hi".to_string() }],
            system: None,
            temperature: Some(0.0),
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
        };
        let start = Instant::now();
        match self
            .http
            .post_json::<AnthropicRequest, serde_json::Value>(ctx, OP_HEALTH, MESSAGES_PATH, &[], &probe)
            .await
        {
            Ok(_) => ProbeResult::ok(start.elapsed(), endpoint),
            Err(e) => ProbeResult::failed(start.elapsed(), endpoint, e.to_string()),
        }
    }

    fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.http.rate_limit_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StopSequences;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(ProviderConfig::new(
            "anthropic-main",
            ProviderType::Anthropic,
            "sk-ant-test",
        ))
        .unwrap()
    }

    #[test]
    fn system_messages_lift_into_dedicated_field() {
        let request = ChatRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![
                Message::system("be terse"),
                Message::system("answer in French"),
                Message::user("hi"),
            ],
            ..Default::default()
        };
        let wire = provider().to_wire(&request, false);
        assert_eq!(wire.system.as_deref(), Some("be terse\nanswer in French"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn max_tokens_is_mandatory_with_default() {
        let request = ChatRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        assert_eq!(provider().to_wire(&request, false).max_tokens, DEFAULT_MAX_TOKENS);

        let capped = ChatRequest { max_tokens: Some(42), ..request };
        assert_eq!(provider().to_wire(&capped, false).max_tokens, 42);
    }

    #[test]
    fn stop_lifts_into_stop_sequences() {
        let request = ChatRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![Message::user("hi")],
            stop: Some(StopSequences::Single("END".to_string())),
            ..Default::default()
        };
        let wire = provider().to_wire(&request, false);
        assert_eq!(wire.stop_sequences, Some(vec!["END".to_string()]));
    }

    #[test]
    fn response_conversion_maps_stop_reason_and_usage() {
        let request = ChatRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let wire: AnthropicResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-sonnet",
            "content": [{"type": "text", "text": "hello"}, {"type": "text", "text": " there"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }))
        .unwrap();

        let response = provider().convert_response(&request, wire);
        assert_eq!(response.provider, "anthropic-main");
        assert_eq!(response.choices[0].message.content, "hello there");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(response.usage.prompt_tokens, 12);
        assert_eq!(response.usage.total_tokens, 15);
    }
}
