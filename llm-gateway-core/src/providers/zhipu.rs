//! Zhipu GLM adapter. The surface is OpenAI-shaped on Zhipu's paas endpoint
//! with Bearer auth; streaming chunks arrive with a space-less `data:` prefix
//! and the stream closes on the `[DONE]` sentinel or a finish reason on the
//! last chunk. Platform error codes share the Baidu-style table.

use crate::error::ClassifiedError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Message, ProbeResult, RateLimitSnapshot, StopSequences,
    Usage,
};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::openai::{estimated_usage, finish_reason_from_wire, wire_role};
use crate::providers::sse::{data_payload, SseLineBuffer};
use crate::providers::{
    Capabilities, Provider, ProviderConfig, ProviderType, RateLimit, StreamHandler,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "https://open.bigmodel.cn";
const CHAT_PATH: &str = "/api/paas/v4/chat/completions";

const OP_CHAT: &str = "chat";
const OP_CHAT_STREAM: &str = "chat_stream";
const OP_HEALTH: &str = "health_probe";

pub struct ZhipuProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct ZhipuRequest {
    model: String,
    messages: Vec<ZhipuMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ZhipuMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ZhipuResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ZhipuChoice>,
    #[serde(default)]
    usage: Option<ZhipuUsage>,
    #[serde(default)]
    error: Option<ZhipuError>,
}

#[derive(Debug, Deserialize)]
struct ZhipuChoice {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    message: Option<ZhipuWireMessage>,
    #[serde(default)]
    delta: Option<ZhipuWireMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZhipuWireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZhipuUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ZhipuError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl ZhipuProvider {
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

    fn to_wire(&self, request: &ChatRequest, stream: bool) -> ZhipuRequest {
        ZhipuRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| ZhipuMessage {
                    role: wire_role(m.role).to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.as_ref().map(StopSequences::to_vec),
            stream: stream.then_some(true),
            user_id: request.user.clone(),
        }
    }

    /// Zhipu reports platform failures either as a numeric code or a numeric
    /// string; both feed the shared code table.
    fn check_platform_error(
        &self,
        operation: &str,
        error: Option<&ZhipuError>,
    ) -> Result<(), ClassifiedError> {
        let Some(error) = error else { return Ok(()) };
        let code = match &error.code {
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        };
        let message = error
            .message
            .clone()
            .unwrap_or_else(|| format!("glm error code {code}"));
        Err(ClassifiedError::from_platform_code(
            code,
            &self.config.name,
            operation,
            message,
        ))
    }

    fn convert_response(&self, request: &ChatRequest, response: ZhipuResponse) -> ChatResponse {
        let choices: Vec<Choice> = response
            .choices
            .into_iter()
            .enumerate()
            .map(|(i, c)| Choice {
                index: c.index.unwrap_or(i as u32),
                message: Message::assistant(
                    c.message.and_then(|m| m.content).unwrap_or_default(),
                ),
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
            id: response
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            model: response.model.unwrap_or_else(|| request.model.clone()),
            provider: self.config.name.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            choices,
            usage,
            latency_ms: 0,
        }
    }
}

#[async_trait::async_trait]
impl Provider for ZhipuProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Zhipu
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { streaming: true, reports_usage: true, rate_limit_headers: false }
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
        let response: ZhipuResponse =
            self.http.post_json(ctx, OP_CHAT, CHAT_PATH, &[], &wire).await?;
        self.check_platform_error(OP_CHAT, response.error.as_ref())?;
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
                // Chunks use a space-less `data:` prefix; the decoder
                // accepts both.
                let Some(payload) = data_payload(&line) else { continue };
                if payload == "[DONE]" {
                    emit("", true);
                    return Ok(());
                }
                let parsed: ZhipuResponse = serde_json::from_str(payload)
                    .map_err(|e| ClassifiedError::invalid_response(self.name(), OP_CHAT_STREAM, e))?;
                self.check_platform_error(OP_CHAT_STREAM, parsed.error.as_ref())?;
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.and_then(|d| d.content) {
                        if !content.is_empty() {
                            emit(&content, false);
                        }
                    }
                    // A finish reason on the last chunk closes the stream.
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
        let endpoint = format!("{}{}", self.http.base_url(), CHAT_PATH);
        let probe = ZhipuRequest {
            model: self
                .config
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| "glm-3-turbo".to_string()),
            messages: vec![ZhipuMessage { role: "user".to_string(), content: "Hi".to_string() }],
            max_tokens: Some(1),
            temperature: Some(0.0),
            top_p: None,
            stop: None,
            stream: None,
            user_id: None,
        };
        let start = Instant::now();
        match self
            .http
            .post_json::<ZhipuRequest, serde_json::Value>(ctx, OP_HEALTH, CHAT_PATH, &[], &probe)
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
    use crate::error::ErrorCategory;
    use crate::models::FinishReason;

    fn provider() -> ZhipuProvider {
        ZhipuProvider::new(ProviderConfig::new("zhipu-main", ProviderType::Zhipu, "glm-key"))
            .unwrap()
    }

    #[test]
    fn stop_normalizes_to_list() {
        let request = ChatRequest {
            model: "glm-4".to_string(),
            messages: vec![Message::user("hi")],
            stop: Some(StopSequences::Single("END".to_string())),
            ..Default::default()
        };
        let wire = provider().to_wire(&request, true);
        assert_eq!(wire.stop, Some(vec!["END".to_string()]));
        assert_eq!(wire.stream, Some(true));
    }

    #[test]
    fn platform_error_accepts_string_codes() {
        let error = ZhipuError {
            code: Some(serde_json::Value::String("1002".to_string())),
            message: Some("invalid token".to_string()),
        };
        let err = provider()
            .check_platform_error(OP_CHAT, Some(&error))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Auth);
    }

    #[test]
    fn buffered_response_converts() {
        let request = ChatRequest {
            model: "glm-4".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let wire: ZhipuResponse = serde_json::from_value(serde_json::json!({
            "id": "glm-1",
            "model": "glm-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "你好"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
        }))
        .unwrap();
        let response = provider().convert_response(&request, wire);
        assert_eq!(response.provider, "zhipu-main");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.total_tokens, 6);
    }
}
