//! # Smart Router
//!
//! Health-aware provider selection with pluggable strategies, composed with
//! the resilience layer. A request flows: candidate build (healthy set,
//! degrading to the full set when empty) → model-affinity and preferred
//! overlay filters → strategy selection with breaker-open providers skipped
//! → cost-ceiling check → adapter invocation, with the retry manager
//! wrapping the whole attempt and metrics plus breaker feedback closing the
//! loop.
//!
//! Reconfiguration swaps an immutable strategy object; requests already
//! selected keep running on the strategy that picked them. Weight updates
//! never block ongoing selections.

pub mod ring;
pub mod strategies;

use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::error::{ClassifiedError, ErrorCategory};
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::models::{ChatRequest, ChatResponse, RoutingDecision};
use crate::providers::{Provider, StreamHandler};
use crate::registry::{ProviderRegistry, RegistryError};
use crate::retry::{RetryManager, RetryPolicy};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use strategies::{
    build_strategy, InFlightMap, StickyBindings, Strategy, StrategyDeps, StrategyKind, WeightTable,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid router configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Router parameters, hot-swappable through [`SmartRouter::update_config`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: StrategyKind,
    /// Delegate used by sticky-session when a tag has no usable binding
    pub sticky_fallback: StrategyKind,
    /// Selection/retry attempts beyond the first
    pub max_retries: u32,
    /// Model name → preferred provider names
    pub model_affinity: HashMap<String, Vec<String>>,
    /// Overlay applied when non-empty and intersecting the candidates
    pub preferred_providers: Vec<String>,
    /// Per-provider weight overrides
    pub weights: HashMap<String, u32>,
    /// Virtual nodes per provider on the consistent-hash ring
    pub virtual_nodes: usize,
    /// Refuse requests whose estimated cost exceeds this; zero disables
    pub per_request_cost_limit: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            sticky_fallback: StrategyKind::RoundRobin,
            max_retries: 3,
            model_affinity: HashMap::new(),
            preferred_providers: Vec::new(),
            weights: HashMap::new(),
            virtual_nodes: ring::DEFAULT_VIRTUAL_NODES,
            per_request_cost_limit: 0.0,
        }
    }
}

impl RouterConfig {
    fn validate(&self) -> Result<(), RouterError> {
        if self.virtual_nodes == 0 {
            return Err(RouterError::InvalidConfig(
                "virtual_nodes must be at least 1".to_string(),
            ));
        }
        if self.per_request_cost_limit < 0.0 {
            return Err(RouterError::InvalidConfig(
                "per_request_cost_limit must not be negative".to_string(),
            ));
        }
        if self.sticky_fallback == StrategyKind::StickySession {
            return Err(RouterError::InvalidConfig(
                "sticky_fallback must not be sticky_session".to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable strategy + config pair; in-flight requests hold the `Arc` they
/// selected under and are unaffected by swaps.
struct ActiveStrategy {
    strategy: Arc<dyn Strategy>,
    config: RouterConfig,
}

#[derive(Default)]
struct LastAttempt {
    provider: Option<String>,
    used_backup: bool,
}

pub struct SmartRouter {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    breaker_config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    retry: RetryManager,
    in_flight: InFlightMap,
    weights: WeightTable,
    sticky: StickyBindings,
    active: RwLock<Arc<ActiveStrategy>>,
}

impl SmartRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsCollector>,
        config: RouterConfig,
        breaker_config: BreakerConfig,
        retry_policy: RetryPolicy,
    ) -> Result<Self, RouterError> {
        config.validate()?;
        let in_flight: InFlightMap = Arc::new(DashMap::new());
        let weights: WeightTable = Arc::new(RwLock::new(config.weights.clone()));
        let sticky: StickyBindings = Arc::new(DashMap::new());
        let deps = StrategyDeps {
            metrics: metrics.clone(),
            health: health.clone(),
            in_flight: in_flight.clone(),
            weights: weights.clone(),
            sticky: sticky.clone(),
        };
        let strategy = build_strategy(
            config.strategy,
            config.sticky_fallback,
            config.virtual_nodes,
            &deps,
        );
        Ok(Self {
            registry,
            health,
            metrics,
            breaker_config,
            breakers: DashMap::new(),
            retry: RetryManager::new(retry_policy),
            in_flight,
            weights,
            sticky,
            active: RwLock::new(Arc::new(ActiveStrategy { strategy, config })),
        })
    }

    fn deps(&self) -> StrategyDeps {
        StrategyDeps {
            metrics: self.metrics.clone(),
            health: self.health.clone(),
            in_flight: self.in_flight.clone(),
            weights: self.weights.clone(),
            sticky: self.sticky.clone(),
        }
    }

    /// Validate and atomically swap the strategy and parameters. Requests
    /// already selected complete on the strategy that selected them.
    pub fn update_config(&self, config: RouterConfig) -> Result<(), RouterError> {
        config.validate()?;
        *self.weights.write().unwrap() = config.weights.clone();
        let strategy = build_strategy(
            config.strategy,
            config.sticky_fallback,
            config.virtual_nodes,
            &self.deps(),
        );
        let active = Arc::new(ActiveStrategy { strategy, config });
        *self.active.write().unwrap() = active;
        tracing::info!("router configuration swapped");
        Ok(())
    }

    /// Hot-path weight update; never blocks ongoing selections beyond a
    /// brief write lock on the weight table.
    pub fn update_weights(&self, updates: HashMap<String, u32>) {
        let mut weights = self.weights.write().unwrap();
        for (provider, weight) in updates {
            weights.insert(provider, weight);
        }
    }

    /// Register a provider and seed its health state so it is immediately
    /// routable.
    pub fn add_provider(&self, provider: Arc<dyn Provider>) -> Result<(), RouterError> {
        let name = provider.name().to_string();
        self.registry.register(provider)?;
        self.health.insert_provider(&name);
        Ok(())
    }

    /// Remove a provider, dropping all of its runtime state atomically.
    pub fn remove_provider(&self, name: &str) -> Result<(), RouterError> {
        self.registry.remove(name)?;
        self.health.remove_provider(name);
        self.metrics.remove_provider(name);
        self.breakers.remove(name);
        self.in_flight.remove(name);
        self.sticky.retain(|_, bound| bound != name);
        Ok(())
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(provider, self.breaker_config.clone()))
            })
            .clone()
    }

    /// Breaker states for the observability surface.
    pub fn breaker_snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn retry_stats(&self) -> crate::retry::RetryStatsSnapshot {
        self.retry.stats()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.active.read().unwrap().strategy.name()
    }

    fn in_flight_counter(&self, provider: &str) -> Arc<AtomicU64> {
        self.in_flight
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn in_flight_count(&self, provider: &str) -> u64 {
        self.in_flight
            .get(provider)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// In-flight requests divided by the provider's declared rpm (1 when
    /// unknown), clamped to [0, 1].
    fn load_factor(&self, provider: &dyn Provider) -> f64 {
        let in_flight = self.in_flight_count(provider.name()) as f64;
        let rpm = provider
            .rate_limit_config()
            .map(|r| r.requests_per_minute)
            .filter(|rpm| *rpm > 0)
            .unwrap_or(1) as f64;
        (in_flight / rpm).clamp(0.0, 1.0)
    }

    fn no_available_provider(&self) -> ClassifiedError {
        let mut err = ClassifiedError::new(
            ErrorCategory::Server,
            "router",
            "routing",
            "no available provider for this request",
        );
        err.retryable = false;
        err.status = Some(503);
        err
    }

    /// Build the candidate list: healthy providers (degrading to the full
    /// set when none are), filtered by model affinity or the generic
    /// supports-model predicate, then the preferred overlay.
    fn candidates(
        &self,
        request: &ChatRequest,
        config: &RouterConfig,
    ) -> Result<(Vec<Arc<dyn Provider>>, bool), ClassifiedError> {
        let mut list = self.registry.enumerate_healthy(&self.health);
        let mut degraded = false;
        if list.is_empty() {
            list = self.registry.enumerate();
            if !list.is_empty() {
                degraded = true;
                tracing::warn!("no healthy providers; degrading to the full provider set");
            }
        }
        if list.is_empty() {
            return Err(self.no_available_provider());
        }

        if let Some(preferred) = config.model_affinity.get(&request.model) {
            let filtered: Vec<_> = list
                .iter()
                .filter(|p| preferred.iter().any(|name| name == p.name()))
                .cloned()
                .collect();
            if filtered.is_empty() {
                tracing::warn!(
                    model = %request.model,
                    "model affinity matched no candidate; falling back to supports-model filter"
                );
                list.retain(|p| supports_model(p.as_ref(), &request.model));
            } else {
                list = filtered;
            }
        } else {
            list.retain(|p| supports_model(p.as_ref(), &request.model));
        }
        if list.is_empty() {
            return Err(self.no_available_provider());
        }

        if !config.preferred_providers.is_empty() {
            let overlay: Vec<_> = list
                .iter()
                .filter(|p| config.preferred_providers.iter().any(|name| name == p.name()))
                .cloned()
                .collect();
            if !overlay.is_empty() {
                list = overlay;
            }
        }
        Ok((list, degraded))
    }

    /// Run the strategy, skipping providers whose breaker refuses the
    /// dispatch, up to `max_retries` re-selections.
    fn select_with_breaker(
        &self,
        active: &ActiveStrategy,
        mut pool: Vec<Arc<dyn Provider>>,
        request: &ChatRequest,
    ) -> Result<(Arc<dyn Provider>, bool), ClassifiedError> {
        let mut skipped_any = false;
        let mut rounds: u32 = 0;
        loop {
            if pool.is_empty() {
                return Err(ClassifiedError::new(
                    ErrorCategory::Server,
                    "router",
                    "routing",
                    "all candidate providers skipped by open circuit breakers",
                ));
            }
            let selected = active.strategy.select(&pool, request)?;
            if self.breaker(selected.name()).allow_request() {
                return Ok((selected, skipped_any));
            }
            tracing::debug!(provider = %selected.name(), "breaker open, re-selecting");
            skipped_any = true;
            pool.retain(|p| p.name() != selected.name());
            rounds += 1;
            if rounds > active.config.max_retries {
                return Err(ClassifiedError::new(
                    ErrorCategory::Server,
                    "router",
                    "routing",
                    format!(
                        "breaker skip budget exhausted after {rounds} re-selections (last: {})",
                        selected.name()
                    ),
                ));
            }
        }
    }

    /// One dispatch attempt: select, enforce the cost ceiling, invoke, and
    /// feed the outcome to the breaker and metrics.
    async fn attempt_once(
        &self,
        ctx: &CancellationToken,
        active: &ActiveStrategy,
        request: ChatRequest,
        attempt: u32,
        last: &Mutex<LastAttempt>,
    ) -> Result<(ChatResponse, RoutingDecision), ClassifiedError> {
        let selection_start = Instant::now();
        let (pool, degraded) = self.candidates(&request, &active.config)?;
        let (provider, skipped) = self.select_with_breaker(active, pool, &request)?;
        self.metrics.record_selection(
            active.strategy.name(),
            provider.name(),
            selection_start.elapsed(),
        );

        let estimate = provider.estimate_cost(&request);
        crate::estimator::enforce_cost_ceiling(
            &estimate,
            active.config.per_request_cost_limit,
            provider.name(),
        )?;

        let load_factor = self.load_factor(provider.as_ref());
        let used_backup = {
            let mut state = last.lock().unwrap();
            state.provider = Some(provider.name().to_string());
            state.used_backup |= degraded || skipped || attempt > 1;
            state.used_backup
        };

        let counter = self.in_flight_counter(provider.name());
        counter.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = provider.invoke(ctx, request).await;
        counter.fetch_sub(1, Ordering::SeqCst);
        let latency = started.elapsed();

        let breaker = self.breaker(provider.name());
        match result {
            Ok(mut response) => {
                breaker.record_success();
                self.metrics.record_request(provider.name(), true, latency);
                response.latency_ms = latency.as_millis() as u64;
                let decision = RoutingDecision {
                    provider: provider.name().to_string(),
                    strategy: active.strategy.name().to_string(),
                    attempt,
                    used_backup,
                    load_factor,
                    selected_at: chrono::Utc::now(),
                };
                Ok((response, decision))
            }
            Err(error) => {
                self.metrics.record_request(provider.name(), false, latency);
                if error.category.counts_toward_breaker() {
                    breaker.record_failure();
                }
                tracing::debug!(
                    provider = %provider.name(),
                    attempt,
                    category = error.category.as_str(),
                    "attempt failed"
                );
                Err(error)
            }
        }
    }

    /// Buffered dispatch: route, invoke and retry transparently across
    /// providers until success or exhaustion.
    pub async fn dispatch(
        &self,
        ctx: &CancellationToken,
        mut request: ChatRequest,
    ) -> Result<(ChatResponse, RoutingDecision), ClassifiedError> {
        if request.id.is_none() {
            request.id = Some(uuid::Uuid::new_v4().to_string());
        }
        let active = self.active.read().unwrap().clone();
        let last = Mutex::new(LastAttempt::default());

        let result = self
            .retry
            .execute(ctx, |attempt| {
                let request = request.clone();
                let active = &active;
                let last = &last;
                async move { self.attempt_once(ctx, active, request, attempt, last).await }
            })
            .await;

        match result {
            Ok(success) => Ok(success),
            Err(error) => {
                // Rate limits count toward the breaker only once retries are
                // exhausted.
                if error.category == ErrorCategory::RateLimit {
                    if let Some(provider) = last.lock().unwrap().provider.clone() {
                        self.breaker(&provider).record_failure();
                    }
                }
                let provider = last.lock().unwrap().provider.clone();
                tracing::warn!(
                    provider = provider.as_deref().unwrap_or("none"),
                    category = error.category.as_str(),
                    "dispatch failed after retries"
                );
                Err(error)
            }
        }
    }

    /// Streamed dispatch. Before the first chunk is emitted, failures may
    /// retry on another provider like the buffered path; once content has
    /// flowed, the error is surfaced so the front-end can close the stream
    /// with an error frame instead of replaying the request.
    pub async fn dispatch_stream(
        &self,
        ctx: &CancellationToken,
        mut request: ChatRequest,
        emit: StreamHandler<'_>,
    ) -> Result<RoutingDecision, ClassifiedError> {
        if request.id.is_none() {
            request.id = Some(uuid::Uuid::new_v4().to_string());
        }
        let active = self.active.read().unwrap().clone();
        let policy = self.retry.policy().clone();
        let mut attempt: u32 = 1;
        let mut emitted_any = false;

        loop {
            let selection_start = Instant::now();
            let (pool, degraded) = self.candidates(&request, &active.config)?;
            let (provider, skipped) = self.select_with_breaker(&active, pool, &request)?;
            self.metrics.record_selection(
                active.strategy.name(),
                provider.name(),
                selection_start.elapsed(),
            );

            let estimate = provider.estimate_cost(&request);
            crate::estimator::enforce_cost_ceiling(
                &estimate,
                active.config.per_request_cost_limit,
                provider.name(),
            )?;

            let load_factor = self.load_factor(provider.as_ref());
            let counter = self.in_flight_counter(provider.name());
            counter.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            let mut got_chunk = false;
            let result = {
                let mut forward = |chunk: &str, done: bool| {
                    if !done {
                        got_chunk = true;
                    }
                    emit(chunk, done);
                };
                provider
                    .invoke_stream(ctx, request.clone(), &mut forward)
                    .await
            };
            counter.fetch_sub(1, Ordering::SeqCst);
            let latency = started.elapsed();
            emitted_any |= got_chunk;

            let breaker = self.breaker(provider.name());
            match result {
                Ok(()) => {
                    breaker.record_success();
                    self.metrics.record_request(provider.name(), true, latency);
                    return Ok(RoutingDecision {
                        provider: provider.name().to_string(),
                        strategy: active.strategy.name().to_string(),
                        attempt,
                        used_backup: degraded || skipped || attempt > 1,
                        load_factor,
                        selected_at: chrono::Utc::now(),
                    });
                }
                Err(error) => {
                    self.metrics.record_request(provider.name(), false, latency);
                    if error.category.counts_toward_breaker() {
                        breaker.record_failure();
                    }

                    let may_retry = !emitted_any
                        && error.retryable
                        && policy.retryable_categories.contains(&error.category)
                        && attempt <= policy.max_retries
                        && !ctx.is_cancelled();
                    if !may_retry {
                        if error.category == ErrorCategory::RateLimit {
                            breaker.record_failure();
                        }
                        return Err(error);
                    }

                    let delay = self
                        .retry
                        .delay_before_attempt(attempt + 1, error.retry_after);
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(ClassifiedError::cancelled(provider.name(), "chat_stream"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn supports_model(provider: &dyn Provider, model: &str) -> bool {
    let models = provider.supported_models();
    models.is_empty() || models.iter().any(|m| m == model)
}
