//! # HTTP Handlers
//!
//! The OpenAI-compatible surface served by the gateway:
//!
//! - `POST /v1/chat/completions`: buffered chat completion (streams when
//!   the body sets `stream: true`)
//! - `POST /v1/chat/stream`: SSE stream: each chunk is an
//!   `event: message` frame whose `data:` payload matches the buffered
//!   response with a `delta` per choice; the terminal frame carries
//!   `done: true`, a final `data: [DONE]` line closes the stream, and an
//!   `event: error` frame precedes close on failure
//! - `GET /v1/models`: aggregated model list across providers
//! - `GET /health`, `GET /health/detailed`: liveness and readiness
//! - `GET /metrics`: Prometheus text exposition (separate listener)
//! - `GET /admin/providers`, `POST /admin/metrics/reset`: runtime state

use crate::gateway_error::GatewayError;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use llm_gateway_core::models::{
    ChatRequest, Delta, FinishReason, StreamChoice, StreamChunk,
};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Decode and validate the request body; shape errors surface as 400s in
/// the standard envelope.
fn parse_request(body: serde_json::Value) -> Result<ChatRequest, GatewayError> {
    let request: ChatRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::invalid_request(format!("malformed request body: {e}")))?;
    if request.model.trim().is_empty() {
        return Err(GatewayError::invalid_request("model is required"));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    }
    Ok(request)
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, GatewayError> {
    let mut request = parse_request(body)?;
    if request.id.is_none() {
        request.id = Some(uuid::Uuid::new_v4().to_string());
    }

    if request.stream == Some(true) {
        return Ok(stream_response(state, request));
    }

    let ctx = CancellationToken::new();
    let (response, decision) = state.router.dispatch(&ctx, request).await?;
    tracing::info!(
        id = %response.id,
        provider = %decision.provider,
        strategy = %decision.strategy,
        attempt = decision.attempt,
        latency_ms = response.latency_ms,
        "chat completion served"
    );
    Ok(Json(response).into_response())
}

/// `POST /v1/chat/stream`
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, GatewayError> {
    let mut request = parse_request(body)?;
    if request.id.is_none() {
        request.id = Some(uuid::Uuid::new_v4().to_string());
    }
    Ok(stream_response(state, request))
}

fn sse_frame(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Drive the router's push stream into an SSE body. The dispatch runs in
/// its own task; a dropped client cancels the context, which closes the
/// upstream connection.
fn stream_response(state: AppState, request: ChatRequest) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let ctx = CancellationToken::new();

    let id = request.id.clone().unwrap_or_default();
    let model = request.model.clone();
    let created = chrono::Utc::now().timestamp() as u64;

    let task_ctx = ctx.clone();
    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let cancel_on_disconnect = task_ctx.clone();
        let chunk_id = id.clone();
        let chunk_model = model.clone();
        let mut emit = move |content: &str, done: bool| {
            // The terminal frame is written after dispatch returns, when the
            // selected provider is known.
            if done {
                return;
            }
            let frame = StreamChunk {
                id: chunk_id.clone(),
                model: chunk_model.clone(),
                provider: String::new(),
                created,
                choices: vec![StreamChoice {
                    index: 0,
                    delta: Delta { content: Some(content.to_string()) },
                    finish_reason: None,
                }],
                done: false,
            };
            let payload = serde_json::to_string(&frame).unwrap_or_default();
            if chunk_tx.send(sse_frame("message", &payload)).is_err() {
                cancel_on_disconnect.cancel();
            }
        };

        match state.router.dispatch_stream(&task_ctx, request, &mut emit).await {
            Ok(decision) => {
                let terminal = StreamChunk {
                    id,
                    model,
                    provider: decision.provider.clone(),
                    created,
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Delta::default(),
                        finish_reason: Some(FinishReason::Stop),
                    }],
                    done: true,
                };
                let payload = serde_json::to_string(&terminal).unwrap_or_default();
                let _ = tx.send(sse_frame("message", &payload));
                let _ = tx.send("data: [DONE]\n\n".to_string());
                tracing::info!(provider = %decision.provider, "stream completed");
            }
            Err(err) => {
                tracing::warn!(category = err.category.as_str(), "stream failed");
                let envelope = GatewayError::from(err).envelope();
                let _ = tx.send(sse_frame("error", &envelope.to_string()));
            }
        }
    });

    let body_stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, std::convert::Infallible>(Bytes::from(frame)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .expect("static response parts are valid")
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .registry
        .enumerate()
        .iter()
        .flat_map(|provider| provider.list_models())
        .map(|descriptor| {
            json!({
                "id": descriptor.name,
                "object": "model",
                "owned_by": descriptor.provider,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// `GET /health` liveness probe: healthy while the probe loop is running.
pub async fn health(State(state): State<AppState>) -> Response {
    if state.health.is_running() {
        Json(json!({ "status": "healthy" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "stopped" })),
        )
            .into_response()
    }
}

/// `GET /health/detailed` readiness probe: healthy iff at least one
/// provider is healthy, degraded otherwise. Database and cache liveness
/// belong to external collaborators and are reported as such.
pub async fn health_detailed(State(state): State<AppState>) -> Response {
    let states = state.health.get_all();
    let any_routable = state
        .registry
        .names()
        .iter()
        .any(|name| state.health.is_routable(name));

    let status = if any_routable { "healthy" } else { "degraded" };
    let providers: serde_json::Map<String, serde_json::Value> = states
        .iter()
        .map(|(name, s)| {
            (
                name.clone(),
                json!({
                    "verdict": s.verdict,
                    "detail": s.status_detail,
                    "consecutive_failures": s.consecutive_failures,
                    "last_rtt_ms": s.last_rtt.map(|d| d.as_millis() as u64),
                }),
            )
        })
        .collect();

    let body = json!({
        "status": status,
        "providers": providers,
        "components": { "database": "external", "cache": "external" },
    });
    if any_routable {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// `GET /admin/providers`: runtime state snapshot per provider.
pub async fn admin_providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let breakers = state.router.breaker_snapshots();
    let providers: Vec<serde_json::Value> = state
        .registry
        .enumerate()
        .iter()
        .map(|provider| {
            let name = provider.name();
            let stats = state.metrics.provider_stats(name);
            json!({
                "name": name,
                "type": provider.provider_type().as_str(),
                "weight": provider.weight(),
                "health": state.health.get(name),
                "breaker": breakers.get(name),
                "in_flight": state.router.in_flight_count(name),
                "stats": stats,
                "rate_limit": provider.rate_limit_snapshot(),
            })
        })
        .collect();
    Json(json!({ "providers": providers, "retry": state.router.retry_stats() }))
}

/// `POST /admin/metrics/reset`
pub async fn admin_reset_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.reset();
    tracing::info!("metrics reset by administrative request");
    Json(json!({ "status": "reset" }))
}

/// `GET /metrics`: Prometheus text exposition, served from the dedicated
/// metrics listener.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let snapshot = state.metrics.snapshot();
    let mut out = String::new();

    out.push_str("# HELP gateway_requests_total Requests routed, by strategy.\n");
    out.push_str("# TYPE gateway_requests_total counter\n");
    for (strategy, stats) in &snapshot.strategies {
        out.push_str(&format!(
            "gateway_requests_total{{strategy=\"{strategy}\"}} {}\n",
            stats.selections
        ));
    }

    out.push_str("# HELP gateway_provider_health Provider health verdict (1 healthy, 0 unhealthy).\n");
    out.push_str("# TYPE gateway_provider_health gauge\n");
    for name in state.registry.names() {
        let value = if state.health.is_routable(&name) { 1 } else { 0 };
        out.push_str(&format!(
            "gateway_provider_health{{provider=\"{name}\"}} {value}\n"
        ));
    }

    out.push_str(
        "# HELP gateway_circuit_breaker_state Breaker state (0 closed, 1 open, 2 half-open).\n",
    );
    out.push_str("# TYPE gateway_circuit_breaker_state gauge\n");
    for (name, breaker) in state.router.breaker_snapshots() {
        out.push_str(&format!(
            "gateway_circuit_breaker_state{{provider=\"{name}\"}} {}\n",
            breaker.state.as_u8()
        ));
    }

    out.push_str("# HELP gateway_provider_latency_seconds Request latency quantiles per provider.\n");
    out.push_str("# TYPE gateway_provider_latency_seconds summary\n");
    for (name, stats) in &snapshot.providers {
        for (quantile, value_ms) in [
            ("0.5", stats.p50_latency_ms),
            ("0.95", stats.p95_latency_ms),
            ("0.99", stats.p99_latency_ms),
        ] {
            out.push_str(&format!(
                "gateway_provider_latency_seconds{{provider=\"{name}\",quantile=\"{quantile}\"}} {}\n",
                value_ms as f64 / 1000.0
            ));
        }
    }

    out.push_str("# HELP gateway_uptime_seconds Seconds since start or the last metrics reset.\n");
    out.push_str("# TYPE gateway_uptime_seconds gauge\n");
    out.push_str(&format!("gateway_uptime_seconds {}\n", snapshot.uptime_secs));

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
        .into_response()
}
