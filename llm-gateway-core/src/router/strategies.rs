//! Pluggable selection strategies. All strategies share one signature and
//! break ties by lexicographic provider name; candidate lists arrive
//! pre-sorted from the registry, so "first strict improvement wins" yields
//! the deterministic tie-break.

use crate::error::{ClassifiedError, ErrorCategory};
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::models::ChatRequest;
use crate::providers::Provider;
use crate::router::ring::HashRing;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Per-provider in-flight request counters, shared between the router and
/// the least-connections strategy.
pub type InFlightMap = Arc<DashMap<String, Arc<AtomicU64>>>;

/// Shared, hot-swappable weight overrides.
pub type WeightTable = Arc<RwLock<HashMap<String, u32>>>;

/// Sticky user-tag to provider bindings.
pub type StickyBindings = Arc<DashMap<String, String>>;

/// Strategy identifiers accepted from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    WeightedRoundRobin,
    LeastLatency,
    CostOptimized,
    LeastConnections,
    Random,
    StickySession,
    ConsistentHash,
    HealthBased,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::WeightedRoundRobin => "weighted_round_robin",
            StrategyKind::LeastLatency => "least_latency",
            StrategyKind::CostOptimized => "cost_optimized",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::Random => "random",
            StrategyKind::StickySession => "sticky_session",
            StrategyKind::ConsistentHash => "consistent_hash",
            StrategyKind::HealthBased => "health_based",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "weighted_round_robin" => Ok(StrategyKind::WeightedRoundRobin),
            "least_latency" => Ok(StrategyKind::LeastLatency),
            "cost_optimized" => Ok(StrategyKind::CostOptimized),
            "least_connections" => Ok(StrategyKind::LeastConnections),
            "random" => Ok(StrategyKind::Random),
            "sticky_session" => Ok(StrategyKind::StickySession),
            "consistent_hash" => Ok(StrategyKind::ConsistentHash),
            "health_based" => Ok(StrategyKind::HealthBased),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// A selection procedure. Implementations may consult the metrics collector
/// and health monitor but never perform I/O.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError>;
}

/// Shared handles the strategies draw on.
#[derive(Clone)]
pub struct StrategyDeps {
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthMonitor>,
    pub in_flight: InFlightMap,
    pub weights: WeightTable,
    pub sticky: StickyBindings,
}

/// Instantiate a strategy object. Sticky-session wraps the configured
/// fallback, which must not itself be sticky-session.
pub fn build_strategy(
    kind: StrategyKind,
    sticky_fallback: StrategyKind,
    virtual_nodes: usize,
    deps: &StrategyDeps,
) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobin::default()),
        StrategyKind::WeightedRoundRobin => {
            Arc::new(WeightedRoundRobin::new(deps.weights.clone()))
        }
        StrategyKind::LeastLatency => Arc::new(LeastLatency { metrics: deps.metrics.clone() }),
        StrategyKind::CostOptimized => Arc::new(CostOptimized),
        StrategyKind::LeastConnections => {
            Arc::new(LeastConnections { in_flight: deps.in_flight.clone() })
        }
        StrategyKind::Random => Arc::new(Random),
        StrategyKind::StickySession => Arc::new(StickySession {
            bindings: deps.sticky.clone(),
            fallback: build_strategy(sticky_fallback, StrategyKind::RoundRobin, virtual_nodes, deps),
        }),
        StrategyKind::ConsistentHash => Arc::new(ConsistentHash {
            ring: RwLock::new(HashRing::new(virtual_nodes)),
        }),
        StrategyKind::HealthBased => Arc::new(HealthBased {
            metrics: deps.metrics.clone(),
            health: deps.health.clone(),
        }),
    }
}

fn no_candidates(strategy: &str) -> ClassifiedError {
    ClassifiedError::new(
        ErrorCategory::Server,
        "router",
        "routing",
        format!("{strategy}: no candidate providers"),
    )
}

/// Atomic counter modulo candidate count.
#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}

/// `argmax(weight / (counter + 1))` with the winner's counter incremented,
/// so long-run selection frequency tracks the weights.
pub struct WeightedRoundRobin {
    counters: Mutex<HashMap<String, u64>>,
    weights: WeightTable,
}

impl WeightedRoundRobin {
    pub fn new(weights: WeightTable) -> Self {
        Self { counters: Mutex::new(HashMap::new()), weights }
    }

    fn weight_of(&self, provider: &dyn Provider) -> u32 {
        let overrides = self.weights.read().unwrap();
        overrides
            .get(provider.name())
            .copied()
            .unwrap_or_else(|| provider.weight().max(1))
    }
}

impl Strategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let mut counters = self.counters.lock().unwrap();
        let mut best: Option<(&Arc<dyn Provider>, f64)> = None;
        for candidate in candidates {
            let count = counters.get(candidate.name()).copied().unwrap_or(0);
            let score = f64::from(self.weight_of(candidate.as_ref())) / (count as f64 + 1.0);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((candidate, score));
            }
        }
        let (winner, _) = best.expect("candidates is non-empty");
        *counters.entry(winner.name().to_string()).or_insert(0) += 1;
        Ok(winner.clone())
    }
}

/// Lowest mean latency from the metrics collector; providers with no
/// samples tie at the top so cold starts are not starved.
pub struct LeastLatency {
    metrics: Arc<MetricsCollector>,
}

impl Strategy for LeastLatency {
    fn name(&self) -> &'static str {
        "least_latency"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let mut best: Option<(&Arc<dyn Provider>, f64)> = None;
        for candidate in candidates {
            // No samples ranks ahead of any measured latency.
            let latency = self.metrics.mean_latency_ms(candidate.name()).unwrap_or(-1.0);
            if best.map(|(_, l)| latency < l).unwrap_or(true) {
                best = Some((candidate, latency));
            }
        }
        Ok(best.expect("candidates is non-empty").0.clone())
    }
}

/// Smallest pre-flight cost estimate for this request.
pub struct CostOptimized;

impl Strategy for CostOptimized {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let mut best: Option<(&Arc<dyn Provider>, f64)> = None;
        for candidate in candidates {
            let total = candidate.estimate_cost(request).total;
            if best.map(|(_, t)| total < t).unwrap_or(true) {
                best = Some((candidate, total));
            }
        }
        Ok(best.expect("candidates is non-empty").0.clone())
    }
}

/// Fewest in-flight requests, from the router's counters.
pub struct LeastConnections {
    in_flight: InFlightMap,
}

impl Strategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let mut best: Option<(&Arc<dyn Provider>, u64)> = None;
        for candidate in candidates {
            let count = self
                .in_flight
                .get(candidate.name())
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            if best.map(|(_, c)| count < c).unwrap_or(true) {
                best = Some((candidate, count));
            }
        }
        Ok(best.expect("candidates is non-empty").0.clone())
    }
}

/// Uniform random pick.
pub struct Random;

impl Strategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }
}

/// Reuse an existing user-tag binding while the bound provider is still a
/// candidate; otherwise delegate to the fallback and persist the new
/// binding. Requests without a user tag go straight to the fallback.
pub struct StickySession {
    bindings: StickyBindings,
    fallback: Arc<dyn Strategy>,
}

impl Strategy for StickySession {
    fn name(&self) -> &'static str {
        "sticky_session"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let Some(user) = request.user.as_deref() else {
            return self.fallback.select(candidates, request);
        };

        if let Some(bound) = self.bindings.get(user).map(|b| b.value().clone()) {
            if let Some(provider) = candidates.iter().find(|p| p.name() == bound) {
                return Ok(provider.clone());
            }
        }
        let selected = self.fallback.select(candidates, request)?;
        self.bindings
            .insert(user.to_string(), selected.name().to_string());
        Ok(selected)
    }
}

/// SHA-1 over `model ⟂ first message content` against a virtual-node ring.
/// The ring rebuilds atomically whenever the candidate set changes.
pub struct ConsistentHash {
    ring: RwLock<HashRing>,
}

impl Strategy for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let names: Vec<String> = candidates.iter().map(|p| p.name().to_string()).collect();
        {
            let mut ring = self.ring.write().unwrap();
            ring.update_nodes(&names);
        }
        let key = format!("{}|{}", request.model, request.first_message_content());
        let ring = self.ring.read().unwrap();
        let node = ring.lookup(&key).ok_or_else(|| no_candidates(self.name()))?;
        candidates
            .iter()
            .find(|p| p.name() == node)
            .cloned()
            .ok_or_else(|| no_candidates(self.name()))
    }
}

/// Composite score: 0.5·success rate + 0.3·rtt factor + 0.2·probe
/// freshness. The rtt factor is `1 − rtt/5s` clamped to [0, 1]; freshness is
/// 1 up to a minute of probe age and decays as `1/(1 + age/1min)` after.
pub struct HealthBased {
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthMonitor>,
}

impl HealthBased {
    fn score(&self, provider: &dyn Provider) -> f64 {
        let success_rate = self.metrics.success_rate(provider.name());
        let state = self.health.get(provider.name());

        let rtt_factor = state
            .as_ref()
            .and_then(|s| s.last_rtt)
            .map(|rtt| (1.0 - rtt.as_secs_f64() / 5.0).clamp(0.0, 1.0))
            // Never probed: give full marks so cold providers stay routable.
            .unwrap_or(1.0);

        let freshness = state
            .as_ref()
            .and_then(|s| s.last_probe)
            .map(|at| {
                let age = (chrono::Utc::now() - at).num_seconds().max(0) as f64;
                if age <= 60.0 {
                    1.0
                } else {
                    1.0 / (1.0 + age / 60.0)
                }
            })
            .unwrap_or(0.0);

        0.5 * success_rate + 0.3 * rtt_factor + 0.2 * freshness
    }
}

impl Strategy for HealthBased {
    fn name(&self) -> &'static str {
        "health_based"
    }

    fn select(
        &self,
        candidates: &[Arc<dyn Provider>],
        _request: &ChatRequest,
    ) -> Result<Arc<dyn Provider>, ClassifiedError> {
        if candidates.is_empty() {
            return Err(no_candidates(self.name()));
        }
        let mut best: Option<(&Arc<dyn Provider>, f64)> = None;
        for candidate in candidates {
            let score = self.score(candidate.as_ref());
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((candidate, score));
            }
        }
        Ok(best.expect("candidates is non-empty").0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::providers::mock::MockProvider;
    use crate::registry::ProviderRegistry;
    use std::collections::HashMap;
    use std::time::Duration;

    fn deps() -> StrategyDeps {
        let registry = Arc::new(ProviderRegistry::new());
        StrategyDeps {
            metrics: Arc::new(MetricsCollector::new()),
            health: Arc::new(HealthMonitor::new(registry, HealthConfig::default()).unwrap()),
            in_flight: Arc::new(DashMap::new()),
            weights: Arc::new(RwLock::new(HashMap::new())),
            sticky: Arc::new(DashMap::new()),
        }
    }

    fn providers(names: &[&str]) -> Vec<Arc<dyn Provider>> {
        names
            .iter()
            .map(|n| Arc::new(MockProvider::new(*n)) as Arc<dyn Provider>)
            .collect()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "mock-model".to_string(),
            messages: vec![crate::models::Message::user("hello")],
            ..Default::default()
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let strategy = RoundRobin::default();
        let candidates = providers(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| strategy.select(&candidates, &request()).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weighted_round_robin_tracks_weights() {
        let deps = deps();
        deps.weights
            .write()
            .unwrap()
            .extend([("a".to_string(), 300u32), ("b".to_string(), 100u32)]);
        let strategy = WeightedRoundRobin::new(deps.weights.clone());
        let candidates = providers(&["a", "b"]);

        let mut tally: HashMap<String, u32> = HashMap::new();
        for _ in 0..40 {
            let pick = strategy.select(&candidates, &request()).unwrap();
            *tally.entry(pick.name().to_string()).or_insert(0) += 1;
        }
        assert_eq!(tally["a"], 30);
        assert_eq!(tally["b"], 10);
    }

    #[test]
    fn least_latency_prefers_cold_then_fastest() {
        let deps = deps();
        let strategy = LeastLatency { metrics: deps.metrics.clone() };
        let candidates = providers(&["a", "b", "c"]);

        deps.metrics.record_request("a", true, Duration::from_millis(50));
        deps.metrics.record_request("b", true, Duration::from_millis(20));
        // "c" has no samples: cold start ties at the top.
        assert_eq!(strategy.select(&candidates, &request()).unwrap().name(), "c");

        deps.metrics.record_request("c", true, Duration::from_millis(400));
        assert_eq!(strategy.select(&candidates, &request()).unwrap().name(), "b");
    }

    #[test]
    fn cost_optimized_picks_cheapest() {
        let candidates: Vec<Arc<dyn Provider>> = vec![
            Arc::new(MockProvider::new("a").with_fixed_cost(0.03)),
            Arc::new(MockProvider::new("b").with_fixed_cost(0.001)),
            Arc::new(MockProvider::new("c").with_fixed_cost(0.02)),
        ];
        let strategy = CostOptimized;
        assert_eq!(strategy.select(&candidates, &request()).unwrap().name(), "b");
    }

    #[test]
    fn least_connections_picks_idle() {
        let deps = deps();
        let strategy = LeastConnections { in_flight: deps.in_flight.clone() };
        let candidates = providers(&["a", "b"]);

        deps.in_flight
            .entry("a".to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .store(5, Ordering::Relaxed);
        assert_eq!(strategy.select(&candidates, &request()).unwrap().name(), "b");
    }

    #[test]
    fn sticky_session_binds_and_reuses() {
        let deps = deps();
        let strategy = StickySession {
            bindings: deps.sticky.clone(),
            fallback: Arc::new(RoundRobin::default()),
        };
        let candidates = providers(&["a", "b", "c"]);

        let mut tagged = request();
        tagged.user = Some("user-1".to_string());

        let first = strategy.select(&candidates, &tagged).unwrap().name().to_string();
        for _ in 0..5 {
            assert_eq!(strategy.select(&candidates, &tagged).unwrap().name(), first);
        }

        // Binding to a vanished provider falls back and rebinds.
        let remaining: Vec<Arc<dyn Provider>> = candidates
            .iter()
            .filter(|p| p.name() != first)
            .cloned()
            .collect();
        let rebound = strategy.select(&remaining, &tagged).unwrap().name().to_string();
        assert_ne!(rebound, first);
        assert_eq!(strategy.select(&remaining, &tagged).unwrap().name(), rebound);
    }

    #[test]
    fn sticky_session_without_tag_delegates() {
        let deps = deps();
        let strategy = StickySession {
            bindings: deps.sticky.clone(),
            fallback: Arc::new(RoundRobin::default()),
        };
        let candidates = providers(&["a", "b"]);
        strategy.select(&candidates, &request()).unwrap();
        assert!(deps.sticky.is_empty());
    }

    #[test]
    fn consistent_hash_is_stable_per_key() {
        let strategy = ConsistentHash { ring: RwLock::new(HashRing::new(150)) };
        let candidates = providers(&["a", "b", "c"]);

        let mut req = request();
        req.messages = vec![crate::models::Message::user("fixed content")];
        let first = strategy.select(&candidates, &req).unwrap().name().to_string();
        for _ in 0..10 {
            assert_eq!(strategy.select(&candidates, &req).unwrap().name(), first);
        }
    }

    #[test]
    fn health_based_prefers_successful_provider() {
        let deps = deps();
        let strategy = HealthBased { metrics: deps.metrics.clone(), health: deps.health.clone() };
        let candidates = providers(&["a", "b"]);

        for _ in 0..10 {
            deps.metrics.record_request("a", false, Duration::from_millis(10));
            deps.metrics.record_request("b", true, Duration::from_millis(10));
        }
        assert_eq!(strategy.select(&candidates, &request()).unwrap().name(), "b");
    }

    #[test]
    fn strategy_kind_round_trips() {
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::LeastLatency,
            StrategyKind::CostOptimized,
            StrategyKind::LeastConnections,
            StrategyKind::Random,
            StrategyKind::StickySession,
            StrategyKind::ConsistentHash,
            StrategyKind::HealthBased,
        ] {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!("geo".parse::<StrategyKind>().is_err());
    }
}
