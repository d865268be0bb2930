//! # Server Assembly
//!
//! Builds the core (registry, health monitor, metrics, router) from the
//! validated configuration, registers the configured providers, and serves
//! the public API and the Prometheus listener until shutdown.

use crate::config::GatewayConfig;
use crate::handlers;
use crate::state::AppState;
use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use std::future::IntoFuture;
use llm_gateway_core::health::HealthMonitor;
use llm_gateway_core::metrics::MetricsCollector;
use llm_gateway_core::providers::create_provider;
use llm_gateway_core::registry::ProviderRegistry;
use llm_gateway_core::router::SmartRouter;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the public API router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/chat/stream", post(handlers::chat_stream))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .route("/admin/providers", get(handlers::admin_providers))
        .route("/admin/metrics/reset", post(handlers::admin_reset_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the metrics router served from the dedicated port.
pub fn build_metrics_app(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}

/// Construct the core from configuration and register every enabled
/// provider.
pub fn build_state(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let registry = Arc::new(ProviderRegistry::new());
    let health = Arc::new(
        HealthMonitor::new(registry.clone(), config.health_config())
            .map_err(anyhow::Error::msg)?,
    );
    let metrics = Arc::new(MetricsCollector::new());
    let router = Arc::new(
        SmartRouter::new(
            registry.clone(),
            health.clone(),
            metrics.clone(),
            config.router_config()?,
            config.breaker_config(),
            config.retry_policy(),
        )
        .map_err(anyhow::Error::msg)?,
    );

    for entry in config.providers.iter().filter(|p| p.enabled) {
        let provider_config = entry.resolve()?;
        let provider = create_provider(provider_config)
            .with_context(|| format!("failed to construct provider {}", entry.name))?;
        router
            .add_provider(provider)
            .with_context(|| format!("failed to register provider {}", entry.name))?;
    }

    Ok(AppState { router, registry, health, metrics })
}

/// Run the gateway until ctrl-c.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let state = build_state(&config)?;

    if config.health.enabled {
        state.health.start().map_err(anyhow::Error::msg)?;
    }

    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind {api_addr}"))?;
    tracing::info!(addr = %api_addr, "gateway listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };

    if config.metrics.enabled {
        let metrics_addr = format!("{}:{}", config.server.host, config.server.metrics_port);
        let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("failed to bind {metrics_addr}"))?;
        tracing::info!(addr = %metrics_addr, "metrics listening");

        let metrics_app = build_metrics_app(state.clone());
        let api_app = build_app(state.clone());
        let metrics_server = axum::serve(metrics_listener, metrics_app).into_future();
        let api_server = axum::serve(api_listener, api_app)
            .with_graceful_shutdown(shutdown)
            .into_future();

        tokio::select! {
            result = api_server => result.context("api server failed")?,
            result = metrics_server => result.context("metrics server failed")?,
        }
    } else {
        let api_app = build_app(state.clone());
        axum::serve(api_listener, api_app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("api server failed")?;
    }

    state.health.stop().await;
    Ok(())
}
