//! Scripted in-process provider. Used by the routing and resilience test
//! scenarios and available from configuration (`type = "mock"`) for smoke
//! deployments: canned reply, per-request latency, scripted failure
//! sequences and chunked streaming.

use crate::error::ClassifiedError;
use crate::estimator::CostEstimate;
use crate::models::{
    ChatRequest, ChatResponse, Choice, FinishReason, Message, ProbeResult, RateLimitSnapshot,
    Usage,
};
use crate::providers::{
    Capabilities, Provider, ProviderConfig, ProviderType, RateLimit, StreamHandler,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of the next scripted call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    FailStatus(u16),
    RateLimited(Duration),
}

struct Script {
    queue: Mutex<VecDeque<MockOutcome>>,
    default: MockOutcome,
}

impl Script {
    fn next(&self) -> MockOutcome {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

pub struct MockProvider {
    name: String,
    weight: u32,
    models: Vec<String>,
    rate_limit: Option<RateLimit>,
    reply: String,
    latency: Duration,
    stream_chunks: usize,
    stream_interval: Duration,
    fixed_cost: Option<f64>,
    healthy: AtomicBool,
    probe_rtt: Duration,
    script: Script,
    invoke_calls: AtomicU64,
    stream_calls: AtomicU64,
    probe_calls: AtomicU64,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 100,
            models: Vec::new(),
            rate_limit: None,
            reply: "mock response".to_string(),
            latency: Duration::ZERO,
            stream_chunks: 4,
            stream_interval: Duration::ZERO,
            fixed_cost: None,
            healthy: AtomicBool::new(true),
            probe_rtt: Duration::from_millis(1),
            script: Script {
                queue: Mutex::new(VecDeque::new()),
                default: MockOutcome::Succeed,
            },
            invoke_calls: AtomicU64::new(0),
            stream_calls: AtomicU64::new(0),
            probe_calls: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: ProviderConfig) -> Self {
        let mut mock = Self::new(config.name);
        mock.weight = config.weight;
        mock.models = config.models;
        mock.rate_limit = config.rate_limit;
        if let Some(reply) = config.extra.get("reply") {
            mock.reply = reply.clone();
        }
        if let Some(latency_ms) = config.extra.get("latency_ms").and_then(|v| v.parse().ok()) {
            mock.latency = Duration::from_millis(latency_ms);
        }
        mock
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
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

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stream the reply as `chunks` pieces spaced `interval` apart.
    pub fn with_stream_pacing(mut self, chunks: usize, interval: Duration) -> Self {
        self.stream_chunks = chunks.max(1);
        self.stream_interval = interval;
        self
    }

    /// Every call fails with the given HTTP status.
    pub fn failing_with_status(mut self, status: u16) -> Self {
        self.script.default = MockOutcome::FailStatus(status);
        self
    }

    /// The first `n` calls fail with the given status, later calls succeed.
    pub fn fail_first(self, n: usize, status: u16) -> Self {
        {
            let mut queue = self.script.queue.lock().unwrap();
            for _ in 0..n {
                queue.push_back(MockOutcome::FailStatus(status));
            }
        }
        self
    }

    /// Queue an explicit outcome sequence ahead of the default.
    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        {
            let mut queue = self.script.queue.lock().unwrap();
            queue.extend(outcomes);
        }
        self
    }

    /// Fixed total for `estimate_cost`, for cost-routing tests.
    pub fn with_fixed_cost(mut self, total: f64) -> Self {
        self.fixed_cost = Some(total);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn invoke_calls(&self) -> u64 {
        self.invoke_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u64 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn apply_outcome(&self, operation: &str) -> Result<(), ClassifiedError> {
        match self.script.next() {
            MockOutcome::Succeed => Ok(()),
            MockOutcome::FailStatus(status) => Err(ClassifiedError::from_status(
                status,
                &self.name,
                operation,
                format!("scripted {status} failure"),
                None,
            )),
            MockOutcome::RateLimited(retry_after) => Err(ClassifiedError::from_status(
                429,
                &self.name,
                operation,
                "scripted rate limit",
                Some(retry_after),
            )),
        }
    }

    fn response_for(&self, request: &ChatRequest) -> ChatResponse {
        let choices = vec![Choice {
            index: 0,
            message: Message::assistant(self.reply.clone()),
            finish_reason: Some(FinishReason::Stop),
        }];
        let usage = Usage::new(
            crate::estimator::estimate_tokens(request, ProviderType::Mock).input_tokens,
            crate::estimator::estimate_completion_tokens(&self.reply, ProviderType::Mock),
        );
        ChatResponse {
            id: request
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            model: request.model.clone(),
            provider: self.name.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            choices,
            usage,
            latency_ms: 0,
        }
    }

    async fn pause(&self, ctx: &CancellationToken, period: Duration, operation: &str) -> Result<(), ClassifiedError> {
        if period.is_zero() {
            if ctx.is_cancelled() {
                return Err(ClassifiedError::cancelled(&self.name, operation));
            }
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(ClassifiedError::cancelled(&self.name, operation)),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Mock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { streaming: true, reports_usage: false, rate_limit_headers: false }
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn rate_limit_config(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, ClassifiedError> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(ctx, self.latency, "chat").await?;
        self.apply_outcome("chat")?;
        Ok(self.response_for(&request))
    }

    async fn invoke_stream(
        &self,
        ctx: &CancellationToken,
        _request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<(), ClassifiedError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(ctx, self.latency, "chat_stream").await?;
        self.apply_outcome("chat_stream")?;

        let chars: Vec<char> = self.reply.chars().collect();
        let chunk_len = chars.len().div_ceil(self.stream_chunks).max(1);
        for piece in chars.chunks(chunk_len) {
            self.pause(ctx, self.stream_interval, "chat_stream").await?;
            let text: String = piece.iter().collect();
            emit(&text, false);
        }
        emit("", true);
        Ok(())
    }

    async fn health_probe(&self, ctx: &CancellationToken) -> ProbeResult {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let endpoint = format!("mock://{}", self.name);
        if self.pause(ctx, self.latency, "health_probe").await.is_err() {
            return ProbeResult::failed(self.probe_rtt, endpoint, "probe cancelled");
        }
        if self.healthy.load(Ordering::SeqCst) {
            ProbeResult::ok(self.probe_rtt, endpoint)
        } else {
            ProbeResult::failed(self.probe_rtt, endpoint, "scripted unhealthy")
        }
    }

    fn estimate_cost(&self, request: &ChatRequest) -> CostEstimate {
        let mut estimate = crate::estimator::estimate_cost(request, ProviderType::Mock);
        if let Some(total) = self.fixed_cost {
            estimate.total = total;
        }
        estimate
    }

    fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        let declared = self.rate_limit.unwrap_or_default();
        RateLimitSnapshot {
            rpm: declared.requests_per_minute,
            tpm: declared.tokens_per_minute,
            ..Default::default()
        }
    }
}
