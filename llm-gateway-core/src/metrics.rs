//! # Metrics Collector
//!
//! Concurrent counters and aggregates consumed by the routing strategies and
//! exposed through the observability surface. Per provider: request/success/
//! failure counts, latency sum/min/max and a ring buffer of the most recent
//! samples from which P50/P95/P99 are derived on demand. Per strategy:
//! selection counts, a moving-average selection latency and a distribution
//! histogram by provider. Updates on the request-completion path are O(1)
//! amortized; percentile recomputation is `O(n log n)` and lazy.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Ring-buffer capacity for per-provider latency samples.
const LATENCY_WINDOW: usize = 1000;

#[derive(Default)]
struct ProviderCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl ProviderCounters {
    fn new() -> Self {
        Self {
            min_ms: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    fn record(&self, success: bool, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);

        let mut samples = self.samples.lock().unwrap();
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }
}

struct StrategyCounters {
    selections: AtomicU64,
    selection_latency: Mutex<MovingAverage>,
    by_provider: Mutex<HashMap<String, u64>>,
}

impl StrategyCounters {
    fn new() -> Self {
        Self {
            selections: AtomicU64::new(0),
            selection_latency: Mutex::new(MovingAverage::default()),
            by_provider: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Default, Clone, Copy)]
struct MovingAverage {
    count: u64,
    mean_us: f64,
}

impl MovingAverage {
    fn push(&mut self, value_us: f64) {
        self.count += 1;
        self.mean_us += (value_us - self.mean_us) / self.count as f64;
    }
}

/// Point-in-time provider statistics.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProviderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

/// Point-in-time strategy statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub selections: u64,
    pub mean_selection_latency_us: f64,
    pub by_provider: HashMap<String, u64>,
}

/// Full collector snapshot for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub uptime_secs: u64,
    pub providers: HashMap<String, ProviderStats>,
    pub strategies: HashMap<String, StrategyStats>,
}

pub struct MetricsCollector {
    providers: RwLock<HashMap<String, Arc<ProviderCounters>>>,
    strategies: RwLock<HashMap<String, Arc<StrategyCounters>>>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    started_at: Mutex<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }

    fn provider_counters(&self, provider: &str) -> Arc<ProviderCounters> {
        if let Some(counters) = self.providers.read().unwrap().get(provider) {
            return counters.clone();
        }
        let mut providers = self.providers.write().unwrap();
        providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderCounters::new()))
            .clone()
    }

    fn strategy_counters(&self, strategy: &str) -> Arc<StrategyCounters> {
        if let Some(counters) = self.strategies.read().unwrap().get(strategy) {
            return counters.clone();
        }
        let mut strategies = self.strategies.write().unwrap();
        strategies
            .entry(strategy.to_string())
            .or_insert_with(|| Arc::new(StrategyCounters::new()))
            .clone()
    }

    /// Record a completed request against a provider.
    pub fn record_request(&self, provider: &str, success: bool, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.provider_counters(provider).record(success, latency);
    }

    /// Record a routing selection made by a strategy.
    pub fn record_selection(&self, strategy: &str, provider: &str, selection_latency: Duration) {
        let counters = self.strategy_counters(strategy);
        counters.selections.fetch_add(1, Ordering::Relaxed);
        counters
            .selection_latency
            .lock()
            .unwrap()
            .push(selection_latency.as_micros() as f64);
        *counters
            .by_provider
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }

    /// Mean request latency for a provider, used by latency-aware routing.
    /// `None` when no samples have been recorded yet.
    pub fn mean_latency_ms(&self, provider: &str) -> Option<f64> {
        let counters = self.providers.read().unwrap().get(provider)?.clone();
        let count = counters.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some(counters.latency_sum_ms.load(Ordering::Relaxed) as f64 / count as f64)
    }

    /// Success rate for a provider; 1.0 when nothing has been recorded.
    pub fn success_rate(&self, provider: &str) -> f64 {
        self.provider_stats(provider)
            .map(|s| s.success_rate())
            .unwrap_or(1.0)
    }

    /// Copy out a provider's statistics, deriving percentiles from a sorted
    /// copy of the sample window.
    pub fn provider_stats(&self, provider: &str) -> Option<ProviderStats> {
        let counters = self.providers.read().unwrap().get(provider)?.clone();
        let requests = counters.requests.load(Ordering::Relaxed);
        let count = counters.latency_count.load(Ordering::Relaxed);
        let sum = counters.latency_sum_ms.load(Ordering::Relaxed);
        let min = counters.min_ms.load(Ordering::Relaxed);

        let mut sorted: Vec<u64> = counters.samples.lock().unwrap().iter().copied().collect();
        sorted.sort_unstable();

        Some(ProviderStats {
            requests,
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            mean_latency_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: counters.max_ms.load(Ordering::Relaxed),
            p50_latency_ms: percentile(&sorted, 0.50),
            p95_latency_ms: percentile(&sorted, 0.95),
            p99_latency_ms: percentile(&sorted, 0.99),
        })
    }

    /// Drop a provider's counters, used when its registration is removed.
    pub fn remove_provider(&self, provider: &str) {
        self.providers.write().unwrap().remove(provider);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let provider_names: Vec<String> =
            self.providers.read().unwrap().keys().cloned().collect();
        let providers = provider_names
            .into_iter()
            .filter_map(|name| {
                let stats = self.provider_stats(&name)?;
                Some((name, stats))
            })
            .collect();

        let strategies = self
            .strategies
            .read()
            .unwrap()
            .iter()
            .map(|(name, counters)| {
                let average = *counters.selection_latency.lock().unwrap();
                (
                    name.clone(),
                    StrategyStats {
                        selections: counters.selections.load(Ordering::Relaxed),
                        mean_selection_latency_us: average.mean_us,
                        by_provider: counters.by_provider.lock().unwrap().clone(),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
            providers,
            strategies,
        }
    }

    /// Clear all counters and restart the uptime clock.
    pub fn reset(&self) {
        self.providers.write().unwrap().clear();
        self.strategies.write().unwrap().clear();
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        *self.started_at.lock().unwrap() = Instant::now();
    }

    /// Wall time since construction or the last reset.
    pub fn uptime(&self) -> Duration {
        self.started_at.lock().unwrap().elapsed()
    }
}

/// `⌈q·n⌉−1` indexing into an ascending sample list; zero on no samples.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((q * sorted.len() as f64).ceil() as usize).saturating_sub(1);
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_indexing_is_exact() {
        let samples: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&samples, 0.50), 50);
        assert_eq!(percentile(&samples, 0.95), 95);
        assert_eq!(percentile(&samples, 0.99), 99);

        let short = vec![10, 20, 30];
        // ceil(0.95 * 3) - 1 = 2
        assert_eq!(percentile(&short, 0.95), 30);
    }

    #[test]
    fn percentiles_on_no_samples_are_zero() {
        assert_eq!(percentile(&[], 0.95), 0);

        let collector = MetricsCollector::new();
        assert!(collector.provider_stats("nobody").is_none());
        assert_eq!(collector.success_rate("nobody"), 1.0);
        assert_eq!(collector.mean_latency_ms("nobody"), None);
    }

    #[test]
    fn request_accounting() {
        let collector = MetricsCollector::new();
        collector.record_request("a", true, Duration::from_millis(100));
        collector.record_request("a", true, Duration::from_millis(300));
        collector.record_request("a", false, Duration::from_millis(500));

        let stats = collector.provider_stats("a").unwrap();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.mean_latency_ms, 300.0);
        assert_eq!(stats.min_latency_ms, 100);
        assert_eq!(stats.max_latency_ms, 500);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.total_failures, 1);
    }

    #[test]
    fn ring_buffer_keeps_last_window() {
        let collector = MetricsCollector::new();
        for i in 0..(LATENCY_WINDOW as u64 + 500) {
            collector.record_request("a", true, Duration::from_millis(i));
        }
        let stats = collector.provider_stats("a").unwrap();
        // The window holds [500, 1499]; P99 indexes near the top of it.
        assert!(stats.p99_latency_ms >= 1480);
        // Min over the full history is still 0.
        assert_eq!(stats.min_latency_ms, 0);
    }

    #[test]
    fn strategy_distribution() {
        let collector = MetricsCollector::new();
        collector.record_selection("round_robin", "a", Duration::from_micros(10));
        collector.record_selection("round_robin", "b", Duration::from_micros(30));
        collector.record_selection("round_robin", "a", Duration::from_micros(20));

        let snapshot = collector.snapshot();
        let stats = &snapshot.strategies["round_robin"];
        assert_eq!(stats.selections, 3);
        assert_eq!(stats.by_provider["a"], 2);
        assert_eq!(stats.by_provider["b"], 1);
        assert!((stats.mean_selection_latency_us - 20.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_and_restarts_uptime() {
        let collector = MetricsCollector::new();
        collector.record_request("a", true, Duration::from_millis(10));
        collector.reset();
        assert!(collector.provider_stats("a").is_none());
        assert_eq!(collector.snapshot().total_requests, 0);
        assert!(collector.uptime() < Duration::from_secs(1));
    }
}
