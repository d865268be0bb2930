//! OpenAI adapter. The normalized request is already OpenAI-shaped, so the
//! translation is a near pass-through: messages go out verbatim and `stop`
//! stays a string or an array, whichever the caller sent.

use crate::error::ClassifiedError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, FinishReason, Message, ProbeResult, RateLimitSnapshot,
    Role, StopSequences, Usage,
};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::sse::{data_payload, SseLineBuffer};
use crate::providers::{
    Capabilities, Provider, ProviderConfig, ProviderType, RateLimit, StreamHandler,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "https://api.openai.com";
const CHAT_PATH: &str = "/v1/chat/completions";
const MODELS_PATH: &str = "/v1/models";

const OP_CHAT: &str = "chat";
const OP_CHAT_STREAM: &str = "chat_stream";
const OP_HEALTH: &str = "health_probe";

pub struct OpenAiProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<StopSequences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    #[serde(default)]
    created: Option<u64>,
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    index: u32,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamPayloadChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamPayloadChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn finish_reason_from_wire(reason: Option<&str>) -> Option<FinishReason> {
    match reason {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        Some("content_filter") => Some(FinishReason::ContentFilter),
        Some("tool_calls") | Some("function_call") => Some(FinishReason::Tool),
        _ => None,
    }
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ClassifiedError> {
        let http = HttpProviderClient::new(
            &config.name,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE,
            &HashMap::new(),
            AuthStrategy::Bearer { token: config.api_key.clone() },
            config.rate_limit,
        )?;
        Ok(Self { http, config })
    }

    fn to_wire(&self, request: &ChatRequest, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: wire_role(m.role).to_string(),
                    content: Some(m.content.clone()),
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            stop: request.stop.clone(),
            stream: stream.then_some(true),
            user: request.user.clone(),
        }
    }

    fn convert_response(&self, request: &ChatRequest, response: OpenAiResponse) -> ChatResponse {
        let choices: Vec<Choice> = response
            .choices
            .into_iter()
            .map(|c| Choice {
                index: c.index,
                message: Message::assistant(c.message.content.unwrap_or_default()),
                finish_reason: finish_reason_from_wire(c.finish_reason.as_deref()),
            })
            .collect();

        let usage = match response.usage {
            Some(u) => Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            },
            None => estimated_usage(request, &choices, self.provider_type()),
        };

        ChatResponse {
            id: response.id,
            model: response.model,
            provider: self.config.name.clone(),
            created: response
                .created
                .unwrap_or_else(|| chrono::Utc::now().timestamp() as u64),
            choices,
            usage,
            latency_ms: 0,
        }
    }
}

/// Fallback usage when the upstream omits it: prompt tokens from the request
/// estimate, completion tokens from the emitted content.
pub(crate) fn estimated_usage(
    request: &ChatRequest,
    choices: &[Choice],
    provider_type: ProviderType,
) -> Usage {
    let prompt = crate::estimator::estimate_tokens(request, provider_type).input_tokens;
    let completion = choices
        .iter()
        .map(|c| crate::estimator::estimate_completion_tokens(&c.message.content, provider_type))
        .sum::<u32>()
        .max(1);
    Usage::new(prompt, completion)
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
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
        let response: OpenAiResponse =
            self.http.post_json(ctx, OP_CHAT, CHAT_PATH, &[], &wire).await?;
        Ok(self.convert_response(&request, response))
    }

    async fn invoke_stream(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<(), ClassifiedError> {
        let wire = self.to_wire(&request, true);
        let resp = self.http.post_raw(ctx, OP_CHAT_STREAM, CHAT_PATH, &[], &wire).await?;
        if !resp.status().is_success() {
            return Err(self.http.classify_response(OP_CHAT_STREAM, resp).await);
        }

        let mut body = resp.bytes_stream();
        let mut lines = SseLineBuffer::new();
        loop {
            // Dropping the body stream on cancellation closes the upstream
            // connection.
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
                if payload == "[DONE]" {
                    emit("", true);
                    return Ok(());
                }
                let parsed: StreamPayload = serde_json::from_str(payload)
                    .map_err(|e| ClassifiedError::invalid_response(self.name(), OP_CHAT_STREAM, e))?;
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            emit(&content, false);
                        }
                    }
                    if choice.finish_reason.is_some() {
                        emit("", true);
                        return Ok(());
                    }
                }
            }
        }
        emit("", true);
        Ok(())
    }

    async fn health_probe(&self, ctx: &CancellationToken) -> ProbeResult {
        let endpoint = format!("{}{}", self.http.base_url(), MODELS_PATH);
        let start = Instant::now();
        match self
            .http
            .get_json::<serde_json::Value>(ctx, OP_HEALTH, MODELS_PATH)
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

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(ProviderConfig::new("openai-main", ProviderType::Openai, "sk-test"))
            .unwrap()
    }

    #[test]
    fn wire_request_passes_messages_through() {
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![Message::system("be terse"), Message::user("hi")],
            stop: Some(StopSequences::Single("END".to_string())),
            max_tokens: Some(32),
            ..Default::default()
        };
        let wire = provider().to_wire(&request, false);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        // Stop stays a bare string when the caller sent one.
        assert_eq!(json["stop"], "END");
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn response_conversion_sets_provider_and_copies_usage() {
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let wire: OpenAiResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "created": 1700000000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        }))
        .unwrap();

        let response = provider().convert_response(&request, wire);
        assert_eq!(response.provider, "openai-main");
        assert_eq!(response.usage.total_tokens, 11);
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.latency_ms, 0);
    }

    #[test]
    fn missing_usage_is_estimated_from_content() {
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let wire: OpenAiResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-2",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "a generated answer with some words"},
                "finish_reason": "stop"
            }]
        }))
        .unwrap();

        let response = provider().convert_response(&request, wire);
        assert!(response.usage.prompt_tokens >= 1);
        assert!(response.usage.completion_tokens >= 1);
        assert_eq!(
            response.usage.total_tokens,
            response.usage.prompt_tokens + response.usage.completion_tokens
        );
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(finish_reason_from_wire(Some("stop")), Some(FinishReason::Stop));
        assert_eq!(finish_reason_from_wire(Some("length")), Some(FinishReason::Length));
        assert_eq!(
            finish_reason_from_wire(Some("content_filter")),
            Some(FinishReason::ContentFilter)
        );
        assert_eq!(finish_reason_from_wire(Some("tool_calls")), Some(FinishReason::Tool));
        assert_eq!(finish_reason_from_wire(None), None);
    }
}
