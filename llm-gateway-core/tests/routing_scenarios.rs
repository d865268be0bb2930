//! End-to-end routing scenarios against scripted mock providers: fairness,
//! breaker failover, retry-after handling, streaming cancellation and the
//! cost ceiling.

use llm_gateway_core::breaker::{BreakerConfig, BreakerState};
use llm_gateway_core::error::ErrorCategory;
use llm_gateway_core::health::{HealthConfig, HealthMonitor};
use llm_gateway_core::metrics::MetricsCollector;
use llm_gateway_core::models::{ChatRequest, Message};
use llm_gateway_core::providers::mock::{MockOutcome, MockProvider};
use llm_gateway_core::providers::Provider;
use llm_gateway_core::registry::ProviderRegistry;
use llm_gateway_core::retry::RetryPolicy;
use llm_gateway_core::router::strategies::StrategyKind;
use llm_gateway_core::router::{RouterConfig, SmartRouter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Harness {
    router: SmartRouter,
}

fn harness(
    providers: Vec<Arc<MockProvider>>,
    router_config: RouterConfig,
    breaker_config: BreakerConfig,
    retry_policy: RetryPolicy,
) -> Harness {
    let registry = Arc::new(ProviderRegistry::new());
    let health = Arc::new(HealthMonitor::new(registry.clone(), HealthConfig::default()).unwrap());
    let metrics = Arc::new(MetricsCollector::new());
    let router = SmartRouter::new(
        registry,
        health,
        metrics,
        router_config,
        breaker_config,
        retry_policy,
    )
    .unwrap();
    for provider in providers {
        router.add_provider(provider as Arc<dyn Provider>).unwrap();
    }
    Harness { router }
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "mock-model".to_string(),
        messages: vec![Message::user("hello")],
        ..Default::default()
    }
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn round_robin_fairness_over_three_providers() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let c = Arc::new(MockProvider::new("c"));
    let h = harness(
        vec![a.clone(), b.clone(), c.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    for _ in 0..30 {
        h.router.dispatch(&ctx, request()).await.unwrap();
    }

    assert_eq!(a.invoke_calls(), 10);
    assert_eq!(b.invoke_calls(), 10);
    assert_eq!(c.invoke_calls(), 10);
}

#[tokio::test]
async fn failing_provider_is_skipped_once_breaker_opens() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let c = Arc::new(MockProvider::new("c").failing_with_status(500));
    let h = harness(
        vec![a.clone(), b.clone(), c.clone()],
        RouterConfig::default(),
        BreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
            ..Default::default()
        },
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    for _ in 0..12 {
        h.router.dispatch(&ctx, request()).await.unwrap();
    }

    // C fails three times, opening its breaker, and is never dispatched to
    // again; everything lands on A and B.
    assert_eq!(c.invoke_calls(), 3);
    assert_eq!(h.router.breaker("c").state(), BreakerState::Open);
    assert_eq!(a.invoke_calls() + b.invoke_calls(), 12);
    assert!(a.invoke_calls() >= 4);
    assert!(b.invoke_calls() >= 4);
}

#[tokio::test]
async fn retry_honors_explicit_retry_after() {
    let a = Arc::new(MockProvider::new("a").with_script(vec![MockOutcome::RateLimited(
        Duration::from_secs(2),
    )]));
    let h = harness(
        vec![a.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        },
    );

    let ctx = CancellationToken::new();
    let started = Instant::now();
    let (response, decision) = h.router.dispatch(&ctx, request()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(a.invoke_calls(), 2);
    assert_eq!(decision.attempt, 2);
    assert!(decision.used_backup);
    assert_eq!(response.provider, "a");
}

#[tokio::test]
async fn stream_cancellation_stops_emission() {
    let a = Arc::new(
        MockProvider::new("a")
            .with_reply("0123456789")
            .with_stream_pacing(10, Duration::from_millis(100)),
    );
    let h = harness(
        vec![a.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(0),
    );

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(330)).await;
        cancel.cancel();
    });

    let events: Mutex<Vec<(String, bool)>> = Mutex::new(Vec::new());
    let mut emit = |chunk: &str, done: bool| {
        events.lock().unwrap().push((chunk.to_string(), done));
    };
    let err = h
        .router
        .dispatch_stream(&ctx, request(), &mut emit)
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Network);
    assert_eq!(err.message, "context cancelled");
    let events = events.lock().unwrap();
    assert!(events.len() <= 4, "got {} chunks", events.len());
    assert!(events.iter().all(|(_, done)| !done));
}

#[tokio::test]
async fn stream_completes_with_single_done() {
    let a = Arc::new(MockProvider::new("a").with_reply("streamed reply"));
    let h = harness(
        vec![a.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(1),
    );

    let ctx = CancellationToken::new();
    let events: Mutex<Vec<(String, bool)>> = Mutex::new(Vec::new());
    let mut emit = |chunk: &str, done: bool| {
        events.lock().unwrap().push((chunk.to_string(), done));
    };
    let decision = h
        .router
        .dispatch_stream(&ctx, request(), &mut emit)
        .await
        .unwrap();

    assert_eq!(decision.provider, "a");
    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|(_, done)| *done).count(), 1);
    assert!(events.last().unwrap().1);
    let text: String = events.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(text, "streamed reply");
}

#[tokio::test]
async fn stream_retries_only_before_first_chunk() {
    // First provider fails before emitting anything: the stream may move to
    // the second provider transparently.
    let a = Arc::new(MockProvider::new("a").failing_with_status(500));
    let b = Arc::new(MockProvider::new("b").with_reply("backup"));
    let h = harness(
        vec![a.clone(), b.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(2),
    );

    let ctx = CancellationToken::new();
    let events: Mutex<Vec<(String, bool)>> = Mutex::new(Vec::new());
    let mut emit = |chunk: &str, done: bool| {
        events.lock().unwrap().push((chunk.to_string(), done));
    };
    let decision = h
        .router
        .dispatch_stream(&ctx, request(), &mut emit)
        .await
        .unwrap();

    assert_eq!(decision.provider, "b");
    assert!(decision.used_backup);
    let text: String = events
        .lock()
        .unwrap()
        .iter()
        .map(|(c, _)| c.as_str())
        .collect();
    assert_eq!(text, "backup");
}

#[tokio::test]
async fn cost_ceiling_refuses_without_touching_provider() {
    let a = Arc::new(MockProvider::new("a").with_fixed_cost(0.05));
    let h = harness(
        vec![a.clone()],
        RouterConfig {
            per_request_cost_limit: 0.01,
            ..Default::default()
        },
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    let err = h.router.dispatch(&ctx, request()).await.unwrap_err();

    assert_eq!(err.category, ErrorCategory::Client);
    assert!(!err.retryable);
    assert_eq!(a.invoke_calls(), 0);
    assert_eq!(h.router.breaker("a").state(), BreakerState::Closed);
}

#[tokio::test]
async fn empty_registry_yields_no_available_provider() {
    let h = harness(
        vec![],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    let err = h.router.dispatch(&ctx, request()).await.unwrap_err();
    assert_eq!(err.status, Some(503));
    assert!(err.message.contains("no available provider"));
}

#[tokio::test]
async fn sticky_session_pins_user_to_provider() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let h = harness(
        vec![a.clone(), b.clone()],
        RouterConfig {
            strategy: StrategyKind::StickySession,
            sticky_fallback: StrategyKind::RoundRobin,
            ..Default::default()
        },
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    let mut tagged = request();
    tagged.user = Some("user-42".to_string());

    let (first, _) = h.router.dispatch(&ctx, tagged.clone()).await.unwrap();
    for _ in 0..5 {
        let (next, _) = h.router.dispatch(&ctx, tagged.clone()).await.unwrap();
        assert_eq!(next.provider, first.provider);
    }
}

#[tokio::test]
async fn unhealthy_set_degrades_to_full_enumeration() {
    let registry = Arc::new(ProviderRegistry::new());
    let health = Arc::new(
        HealthMonitor::new(
            registry.clone(),
            HealthConfig {
                failure_threshold: 1,
                success_threshold: 1,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let metrics = Arc::new(MetricsCollector::new());
    let router = SmartRouter::new(
        registry,
        health.clone(),
        metrics,
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(3),
    )
    .unwrap();

    let a = Arc::new(MockProvider::new("a"));
    router.add_provider(a.clone() as Arc<dyn Provider>).unwrap();

    // Drive the verdict to unhealthy; chat invocations still succeed, so
    // the router degrades to the full set rather than failing outright.
    a.set_healthy(false);
    health.run_probe_round().await;
    assert!(!health.is_routable("a"));

    let ctx = CancellationToken::new();
    let (response, decision) = router.dispatch(&ctx, request()).await.unwrap();
    assert_eq!(response.provider, "a");
    assert!(decision.used_backup);
}

#[tokio::test]
async fn config_swap_changes_strategy_and_rejects_invalid() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let h = harness(
        vec![a.clone(), b.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(3),
    );

    let invalid = RouterConfig { virtual_nodes: 0, ..Default::default() };
    assert!(h.router.update_config(invalid).is_err());

    h.router
        .update_config(RouterConfig {
            strategy: StrategyKind::ConsistentHash,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(h.router.strategy_name(), "consistent_hash");

    // The same request now lands on the same provider every time.
    let ctx = CancellationToken::new();
    let (first, _) = h.router.dispatch(&ctx, request()).await.unwrap();
    for _ in 0..5 {
        let (next, _) = h.router.dispatch(&ctx, request()).await.unwrap();
        assert_eq!(next.provider, first.provider);
    }
}

#[tokio::test]
async fn removed_provider_loses_all_runtime_state() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let h = harness(
        vec![a.clone(), b.clone()],
        RouterConfig::default(),
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    for _ in 0..4 {
        h.router.dispatch(&ctx, request()).await.unwrap();
    }

    h.router.remove_provider("a").unwrap();
    assert!(h.router.remove_provider("a").is_err());

    // Every subsequent dispatch lands on the survivor.
    for _ in 0..4 {
        let (response, _) = h.router.dispatch(&ctx, request()).await.unwrap();
        assert_eq!(response.provider, "b");
    }
    assert_eq!(h.router.in_flight_count("a"), 0);
}

#[tokio::test]
async fn weight_update_does_not_disturb_inflight_strategy() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let h = harness(
        vec![a.clone(), b.clone()],
        RouterConfig {
            strategy: StrategyKind::WeightedRoundRobin,
            ..Default::default()
        },
        BreakerConfig::default(),
        fast_retry(3),
    );

    let ctx = CancellationToken::new();
    h.router.dispatch(&ctx, request()).await.unwrap();
    h.router
        .update_weights([("a".to_string(), 1u32), ("b".to_string(), 500u32)].into());
    // Selections continue without error under the new weights.
    for _ in 0..5 {
        h.router.dispatch(&ctx, request()).await.unwrap();
    }
    assert!(b.invoke_calls() > a.invoke_calls());
}
