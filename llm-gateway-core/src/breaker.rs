//! # Circuit Breaker
//!
//! One breaker guards each provider. The state machine:
//!
//! - **closed → open** when the consecutive failure count reaches the
//!   threshold
//! - **open → half-open** lazily, on the first `is_open` query at least
//!   `open_timeout` after the last failure
//! - **half-open → closed** after the required consecutive successes
//! - **half-open → open** on any failure, or when more probes than the
//!   budget have been dispatched
//!
//! `is_open` is an atomic state read; the mutex-guarded transition routine
//! runs only when the state is `open` and the timeout may have elapsed.
//! Breaker-open is a router hint, never a health verdict.
//!
//! The adaptive variant recomputes the failure threshold each adaptation
//! period from the rolling success rate, within configured bounds; both
//! variants implement the same state-machine contract.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Numeric encoding used by the Prometheus exposition.
    pub fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

/// Static breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Wall time in open state before the next query may probe again
    pub open_timeout: Duration,
    /// Probes allowed while half-open before the circuit re-opens
    pub half_open_probe_budget: u32,
    /// Consecutive successes required to close from half-open
    pub half_open_success_required: u32,
    /// Optional adaptive threshold tuning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_probe_budget: 3,
            half_open_success_required: 3,
            adaptive: None,
        }
    }
}

/// Adaptive threshold tuning. Each period: success rate above 0.95 raises
/// the threshold by one, below 0.80 lowers it by one, both clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub adaptation_period: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_threshold: 2,
            max_threshold: 20,
            adaptation_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_probes: u32,
    half_open_successes: u32,
    /// Current effective threshold; equals the configured one unless the
    /// adaptive variant has moved it
    threshold: u32,
    period_started: Instant,
    period_successes: u64,
    period_failures: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let threshold = config.failure_threshold;
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                failure_count: 0,
                last_failure: None,
                half_open_probes: 0,
                half_open_successes: 0,
                threshold,
                period_started: Instant::now(),
                period_successes: 0,
                period_failures: 0,
            }),
        }
    }

    /// Whether the circuit currently blocks requests. An `open` reading
    /// triggers the lazy open → half-open transition once the timeout has
    /// elapsed since the last failure.
    pub fn is_open(&self) -> bool {
        match BreakerState::from_u8(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let mut inner = self.inner.lock().unwrap();
                // Re-check under the lock; another thread may have already
                // transitioned.
                if BreakerState::from_u8(self.state.load(Ordering::Acquire)) != BreakerState::Open {
                    return false;
                }
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.half_open_probes = 0;
                    inner.half_open_successes = 0;
                    self.state
                        .store(BreakerState::HalfOpen.as_u8(), Ordering::Release);
                    tracing::info!(breaker = %self.name, "circuit half-open");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Gate a dispatch through the breaker. Equivalent to `is_open` plus
    /// half-open probe accounting: once more than the probe budget has been
    /// dispatched without closing, the circuit re-opens.
    pub fn allow_request(&self) -> bool {
        if self.is_open() {
            return false;
        }
        if BreakerState::from_u8(self.state.load(Ordering::Acquire)) == BreakerState::HalfOpen {
            let mut inner = self.inner.lock().unwrap();
            if BreakerState::from_u8(self.state.load(Ordering::Acquire)) != BreakerState::HalfOpen {
                return true;
            }
            if inner.half_open_probes >= self.config.half_open_probe_budget {
                inner.last_failure = Some(Instant::now());
                self.state.store(BreakerState::Open.as_u8(), Ordering::Release);
                tracing::warn!(breaker = %self.name, "half-open probe budget exhausted, re-opening");
                return false;
            }
            inner.half_open_probes += 1;
        }
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.period_successes += 1;
        self.adapt(&mut inner);
        match BreakerState::from_u8(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_required {
                    inner.failure_count = 0;
                    inner.half_open_probes = 0;
                    inner.half_open_successes = 0;
                    self.state.store(BreakerState::Closed.as_u8(), Ordering::Release);
                    tracing::info!(breaker = %self.name, "circuit closed");
                }
            }
            // A late success from a request dispatched before the circuit
            // opened; nothing to do.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.period_failures += 1;
        self.adapt(&mut inner);
        inner.last_failure = Some(Instant::now());
        match BreakerState::from_u8(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= inner.threshold {
                    self.state.store(BreakerState::Open.as_u8(), Ordering::Release);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit open"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_probes = 0;
                inner.half_open_successes = 0;
                self.state.store(BreakerState::Open.as_u8(), Ordering::Release);
                tracing::warn!(breaker = %self.name, "half-open probe failed, re-opening");
            }
            BreakerState::Open => {}
        }
    }

    /// Adaptive threshold recomputation; a no-op for the static variant.
    fn adapt(&self, inner: &mut BreakerInner) {
        let Some(adaptive) = &self.config.adaptive else { return };
        if inner.period_started.elapsed() < adaptive.adaptation_period {
            return;
        }
        let total = inner.period_successes + inner.period_failures;
        if total > 0 {
            let rate = inner.period_successes as f64 / total as f64;
            if rate > 0.95 {
                inner.threshold = (inner.threshold + 1).min(adaptive.max_threshold);
            } else if rate < 0.80 {
                inner.threshold = inner.threshold.saturating_sub(1).max(adaptive.min_threshold);
            }
        }
        inner.period_started = Instant::now();
        inner.period_successes = 0;
        inner.period_failures = 0;
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: self.state(),
            failure_count: inner.failure_count,
            threshold: inner.threshold,
        }
    }

    /// Manually open the circuit, for tests and operational overrides.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());
        self.state.store(BreakerState::Open.as_u8(), Ordering::Release);
    }

    /// Manually reset to closed.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        inner.half_open_probes = 0;
        inner.half_open_successes = 0;
        self.state.store(BreakerState::Closed.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout,
                half_open_probe_budget: 3,
                half_open_success_required: 2,
                adaptive: None,
            },
        )
    }

    #[test]
    fn opens_at_failure_threshold() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_transitions_to_half_open_lazily() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure();

        // Before the timeout every query reports open.
        assert!(breaker.is_open());
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(80)).await;
        // The first query after the timeout performs the transition.
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_required_successes() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn half_open_probe_budget_is_enforced() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Budget of 3 probes without a verdict.
        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        // Fourth dispatch exceeds the budget and re-opens.
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn adaptive_threshold_moves_with_success_rate() {
        let breaker = CircuitBreaker::new(
            "adaptive",
            BreakerConfig {
                failure_threshold: 5,
                open_timeout: Duration::from_secs(30),
                half_open_probe_budget: 3,
                half_open_success_required: 3,
                adaptive: Some(AdaptiveConfig {
                    min_threshold: 2,
                    max_threshold: 10,
                    adaptation_period: Duration::ZERO,
                }),
            },
        );

        // All successes: threshold creeps up.
        breaker.record_success();
        breaker.record_success();
        assert!(breaker.snapshot().threshold >= 5);

        // Heavy failures: threshold comes back down, clamped at min. The
        // breaker opens along the way, which does not stop adaptation.
        for _ in 0..30 {
            breaker.record_failure();
        }
        assert!(breaker.snapshot().threshold >= 2);
    }

    #[test]
    fn force_controls() {
        let breaker = breaker(5, Duration::from_secs(30));
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.force_closed();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.is_open());
    }
}
