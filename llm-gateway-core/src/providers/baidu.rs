//! Baidu Wenxin (ERNIE) adapter. Requests authenticate with a short-lived
//! OAuth access token passed as a query parameter; the adapter refreshes the
//! token through a single-flight mutex once its cached expiry, minus a
//! five-minute safety margin, has passed. Model names map to fixed sub-paths
//! under the chat endpoint.

use crate::error::{ClassifiedError, ErrorCategory};
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
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "https://aip.baidubce.com";
const TOKEN_PATH: &str = "/oauth/2.0/token";
const CHAT_PATH_PREFIX: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat";

/// Refresh the access token this long before its reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

const OP_CHAT: &str = "chat";
const OP_CHAT_STREAM: &str = "chat_stream";
const OP_HEALTH: &str = "health_probe";
const OP_TOKEN: &str = "token_refresh";

/// Fixed model-name to endpoint sub-path lookup.
const MODEL_ENDPOINTS: &[(&str, &str)] = &[
    ("ernie-bot", "completions"),
    ("ernie-bot-turbo", "eb-instant"),
    ("ernie-bot-4", "completions_pro"),
    ("ernie-4.0", "completions_pro"),
    ("ernie-speed", "ernie_speed"),
];

pub struct BaiduProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
    client_secret: String,
    /// Held across the refresh await so concurrent callers coalesce onto a
    /// single in-flight token request.
    token: tokio::sync::Mutex<Option<AccessToken>>,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn usable(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct BaiduRequest {
    messages: Vec<BaiduMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    penalty_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct BaiduMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct BaiduResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_end: Option<bool>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    usage: Option<BaiduUsage>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BaiduUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl BaiduProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ClassifiedError> {
        let client_secret = config.extra.get("client_secret").cloned().ok_or_else(|| {
            ClassifiedError::new(
                ErrorCategory::Client,
                &config.name,
                "init",
                "baidu provider requires a client_secret extra",
            )
        })?;
        let http = HttpProviderClient::new(
            &config.name,
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE,
            &HashMap::new(),
            AuthStrategy::None,
            config.rate_limit,
        )?;
        Ok(Self { http, config, client_secret, token: tokio::sync::Mutex::new(None) })
    }

    /// Endpoint sub-path for a model, from the fixed lookup table.
    fn endpoint_for(&self, model: &str) -> Result<String, ClassifiedError> {
        MODEL_ENDPOINTS
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, path)| format!("{CHAT_PATH_PREFIX}/{path}"))
            .ok_or_else(|| {
                ClassifiedError::new(
                    ErrorCategory::Client,
                    &self.config.name,
                    OP_CHAT,
                    format!("model {model} has no wenxin endpoint mapping"),
                )
            })
    }

    /// Return a usable access token, refreshing it when the cached expiry
    /// minus the safety margin has passed. The mutex is held across the
    /// refresh so only one request is ever in flight.
    async fn access_token(&self, ctx: &CancellationToken) -> Result<String, ClassifiedError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.usable() {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!(provider = %self.config.name, "refreshing wenxin access token");
        let query = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.config.api_key.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        let response: TokenResponse = self
            .http
            .post_json(ctx, OP_TOKEN, TOKEN_PATH, &query, &serde_json::json!({}))
            .await?;

        if let Some(error) = response.error {
            let detail = response.error_description.unwrap_or_default();
            return Err(ClassifiedError::new(
                ErrorCategory::Auth,
                &self.config.name,
                OP_TOKEN,
                format!("token refresh rejected: {error} {detail}"),
            ));
        }
        let (value, expires_in) = match (response.access_token, response.expires_in) {
            (Some(value), Some(expires_in)) => (value, expires_in),
            _ => {
                return Err(ClassifiedError::new(
                    ErrorCategory::Auth,
                    &self.config.name,
                    OP_TOKEN,
                    "token response missing access_token",
                ))
            }
        };
        let token = AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        };
        *guard = Some(token);
        Ok(value)
    }

    fn to_wire(&self, request: &ChatRequest, stream: bool) -> BaiduRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !message.content.is_empty() {
                        system_parts.push(message.content.clone());
                    }
                }
                Role::User => messages.push(BaiduMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                Role::Assistant => messages.push(BaiduMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                }),
                Role::Tool => {}
            }
        }

        BaiduRequest {
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n"))
            },
            temperature: request.temperature,
            top_p: request.top_p,
            penalty_score: request.presence_penalty,
            max_output_tokens: request.max_tokens,
            stop: request.stop.as_ref().map(|s| s.to_vec()),
            stream: stream.then_some(true),
            user_id: request.user.clone(),
        }
    }

    fn check_platform_error(
        &self,
        operation: &str,
        response: &BaiduResponse,
    ) -> Result<(), ClassifiedError> {
        if let Some(code) = response.error_code {
            let message = response
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("wenxin error code {code}"));
            return Err(ClassifiedError::from_platform_code(
                code,
                &self.config.name,
                operation,
                message,
            ));
        }
        Ok(())
    }

    fn convert_response(&self, request: &ChatRequest, response: BaiduResponse) -> ChatResponse {
        let content = response.result.unwrap_or_default();
        let finish_reason = match response.finish_reason.as_deref() {
            Some("normal") | None => Some(FinishReason::Stop),
            Some("length") => Some(FinishReason::Length),
            Some("content_filter") => Some(FinishReason::ContentFilter),
            Some(_) => Some(FinishReason::Stop),
        };
        let choices = vec![Choice { index: 0, message: Message::assistant(content), finish_reason }];

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
            model: request.model.clone(),
            provider: self.config.name.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            choices,
            usage,
            latency_ms: 0,
        }
    }
}

#[async_trait::async_trait]
impl Provider for BaiduProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Baidu
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { streaming: true, reports_usage: true, rate_limit_headers: false }
    }

    fn weight(&self) -> u32 {
        self.config.weight
    }

    fn supported_models(&self) -> Vec<String> {
        if self.config.models.is_empty() {
            MODEL_ENDPOINTS.iter().map(|(name, _)| name.to_string()).collect()
        } else {
            self.config.models.clone()
        }
    }

    fn rate_limit_config(&self) -> Option<RateLimit> {
        self.config.rate_limit
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, ClassifiedError> {
        let path = self.endpoint_for(&request.model)?;
        let token = self.access_token(ctx).await?;
        let wire = self.to_wire(&request, false);
        let response: BaiduResponse = self
            .http
            .post_json(ctx, OP_CHAT, &path, &[("access_token", token)], &wire)
            .await?;
        self.check_platform_error(OP_CHAT, &response)?;
        Ok(self.convert_response(&request, response))
    }

    async fn invoke_stream(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<(), ClassifiedError> {
        let path = self.endpoint_for(&request.model)?;
        let token = self.access_token(ctx).await?;
        let wire = self.to_wire(&request, true);
        let resp = self
            .http
            .post_raw(ctx, OP_CHAT_STREAM, &path, &[("access_token", token)], &wire)
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
                let parsed: BaiduResponse = serde_json::from_str(payload)
                    .map_err(|e| ClassifiedError::invalid_response(self.name(), OP_CHAT_STREAM, e))?;
                self.check_platform_error(OP_CHAT_STREAM, &parsed)?;
                if let Some(result) = parsed.result {
                    if !result.is_empty() {
                        emit(&result, false);
                    }
                }
                if parsed.is_end == Some(true) {
                    emit("", true);
                    return Ok(());
                }
            }
        }
        emit("", true);
        Ok(())
    }

    async fn health_probe(&self, ctx: &CancellationToken) -> ProbeResult {
        let endpoint = format!("{}{}", self.http.base_url(), TOKEN_PATH);
        let start = Instant::now();
        // A token round trip exercises auth and reachability without
        // consuming model quota.
        match self.access_token(ctx).await {
            Ok(_) => ProbeResult::ok(start.elapsed(), endpoint),
            Err(e) => ProbeResult::failed(start.elapsed(), endpoint, e.to_string()),
        }
    }

    fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.http.rate_limit_snapshot()
    }
}
