//! # Health Monitor
//!
//! Periodic, concurrent probing of every registered provider. Each tick
//! fans out one probe task per provider under a shared deadline, then folds
//! the outcomes into per-provider streak counters. A verdict only flips
//! after the configured number of consecutive contrary probes, and every
//! flip emits a structured event for the router and the metrics surface.
//!
//! Providers added while the monitor runs start out routable: their initial
//! verdict is healthy with status `"unknown"`, and the first probe
//! re-evaluates it. Readers always get deep copies, never references into
//! the live table.

use crate::models::ProbeResult;
use crate::registry::ProviderRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("health monitor is already started")]
    AlreadyStarted,
    #[error("invalid health configuration: {0}")]
    InvalidConfig(String),
}

/// Health verdict for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Monitor parameters. The probe timeout must be strictly shorter than the
/// probe interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed probes before healthy flips to unhealthy
    pub failure_threshold: u32,
    /// Consecutive successful probes before unhealthy flips back
    pub success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

/// Per-provider health state. `get`/`get_all` return copies of this.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthState {
    pub verdict: HealthVerdict,
    /// Free-form detail: `"unknown"` before the first probe, `"ok"` after a
    /// success, the error text after a failure
    pub status_detail: String,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_rtt: Option<Duration>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl ProviderHealthState {
    fn initial() -> Self {
        Self {
            verdict: HealthVerdict::Healthy,
            status_detail: "unknown".to_string(),
            last_probe: None,
            last_rtt: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Emitted on every verdict flip.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub provider: String,
    pub from: HealthVerdict,
    pub to: HealthVerdict,
    pub at: DateTime<Utc>,
}

/// Shared core of the monitor; the spawned probe loop owns a clone.
#[derive(Clone)]
struct ProbeContext {
    config: HealthConfig,
    registry: Arc<ProviderRegistry>,
    states: Arc<RwLock<HashMap<String, ProviderHealthState>>>,
    events: broadcast::Sender<HealthEvent>,
}

impl ProbeContext {
    /// One probe round: fan out a task per provider, await all under the
    /// shared deadline, fold results into the state table.
    async fn run_round(&self) {
        let providers = self.registry.enumerate();
        let timeout = self.config.timeout;
        let handles: Vec<JoinHandle<(String, Option<ProbeResult>)>> = providers
            .into_iter()
            .map(|provider| {
                tokio::spawn(async move {
                    let name = provider.name().to_string();
                    let ctx = CancellationToken::new();
                    match tokio::time::timeout(timeout, provider.health_probe(&ctx)).await {
                        Ok(result) => (name, Some(result)),
                        Err(_) => (name, None),
                    }
                })
            })
            .collect();

        for handle in handles {
            if let Ok((name, result)) = handle.await {
                self.apply_probe(&name, result);
            }
        }
    }

    fn apply_probe(&self, name: &str, result: Option<ProbeResult>) {
        let mut states = self.states.write().unwrap();
        let state = states
            .entry(name.to_string())
            .or_insert_with(ProviderHealthState::initial);
        state.last_probe = Some(Utc::now());

        let mut flip: Option<(HealthVerdict, HealthVerdict)> = None;
        match result {
            Some(probe) if probe.healthy => {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
                state.last_rtt = Some(probe.rtt);
                state.status_detail = "ok".to_string();
                if state.verdict != HealthVerdict::Healthy
                    && state.consecutive_successes >= self.config.success_threshold
                {
                    flip = Some((state.verdict, HealthVerdict::Healthy));
                    state.verdict = HealthVerdict::Healthy;
                }
            }
            other => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.status_detail = match other {
                    Some(probe) => {
                        state.last_rtt = Some(probe.rtt);
                        probe.error.unwrap_or_else(|| "probe failed".to_string())
                    }
                    None => "probe timeout".to_string(),
                };
                if state.verdict != HealthVerdict::Unhealthy
                    && state.consecutive_failures >= self.config.failure_threshold
                {
                    flip = Some((state.verdict, HealthVerdict::Unhealthy));
                    state.verdict = HealthVerdict::Unhealthy;
                }
            }
        }
        drop(states);

        if let Some((from, to)) = flip {
            tracing::warn!(provider = %name, ?from, ?to, "health verdict flipped");
            let _ = self.events.send(HealthEvent {
                provider: name.to_string(),
                from,
                to,
                at: Utc::now(),
            });
        }
    }
}

pub struct HealthMonitor {
    probe: ProbeContext,
    running: AtomicBool,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: HealthConfig,
    ) -> Result<Self, MonitorError> {
        if config.timeout >= config.interval {
            return Err(MonitorError::InvalidConfig(format!(
                "probe timeout {:?} must be shorter than the interval {:?}",
                config.timeout, config.interval
            )));
        }
        if config.failure_threshold == 0 || config.success_threshold == 0 {
            return Err(MonitorError::InvalidConfig(
                "thresholds must be at least 1".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            probe: ProbeContext {
                config,
                registry,
                states: Arc::new(RwLock::new(HashMap::new())),
                events,
            },
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Start the probe loop. Rejects a second start while running.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyStarted);
        }
        let probe = self.probe.clone();
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                probe.run_round().await;
            }
        });
        *self.task.lock().unwrap() = Some((token, handle));
        tracing::info!(interval = ?self.probe.config.interval, "health monitor started");
        Ok(())
    }

    /// Stop the probe loop. Safe to call repeatedly.
    pub async fn stop(&self) {
        let taken = self.task.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.await;
            tracing::info!("health monitor stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to verdict-flip events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.probe.events.subscribe()
    }

    /// Run a single probe round outside the loop, for tests and manual
    /// re-evaluation.
    pub async fn run_probe_round(&self) {
        self.probe.run_round().await;
    }

    /// Whether the router may send traffic to this provider. Providers with
    /// no recorded state are routable.
    pub fn is_routable(&self, name: &str) -> bool {
        self.probe
            .states
            .read()
            .unwrap()
            .get(name)
            .map(|s| s.verdict != HealthVerdict::Unhealthy)
            .unwrap_or(true)
    }

    /// Seed state for a provider added at runtime: healthy with status
    /// `"unknown"`, immediately routable.
    pub fn insert_provider(&self, name: &str) {
        self.probe
            .states
            .write()
            .unwrap()
            .insert(name.to_string(), ProviderHealthState::initial());
    }

    /// Drop a provider's state atomically.
    pub fn remove_provider(&self, name: &str) {
        self.probe.states.write().unwrap().remove(name);
    }

    /// Deep copy of the full state table.
    pub fn get_all(&self) -> HashMap<String, ProviderHealthState> {
        self.probe.states.read().unwrap().clone()
    }

    /// Deep copy of one provider's state.
    pub fn get(&self, name: &str) -> Option<ProviderHealthState> {
        self.probe.states.read().unwrap().get(name).cloned()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.probe.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use crate::providers::Provider;

    fn setup(
        failure_threshold: u32,
        success_threshold: u32,
    ) -> (Arc<HealthMonitor>, Arc<MockProvider>) {
        let registry = Arc::new(ProviderRegistry::new());
        let provider = Arc::new(MockProvider::new("a"));
        registry
            .register(provider.clone() as Arc<dyn Provider>)
            .unwrap();
        let monitor = Arc::new(
            HealthMonitor::new(
                registry,
                HealthConfig {
                    interval: Duration::from_secs(30),
                    timeout: Duration::from_secs(5),
                    failure_threshold,
                    success_threshold,
                },
            )
            .unwrap(),
        );
        (monitor, provider)
    }

    #[test]
    fn timeout_must_be_shorter_than_interval() {
        let registry = Arc::new(ProviderRegistry::new());
        let config = HealthConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(
            HealthMonitor::new(registry, config),
            Err(MonitorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn verdict_flips_only_after_threshold() {
        let (monitor, provider) = setup(3, 2);
        let mut events = monitor.subscribe();

        provider.set_healthy(false);
        monitor.run_probe_round().await;
        monitor.run_probe_round().await;
        // Two failures with threshold 3: still routable.
        assert!(monitor.is_routable("a"));

        monitor.run_probe_round().await;
        assert!(!monitor.is_routable("a"));
        let event = events.try_recv().unwrap();
        assert_eq!(event.to, HealthVerdict::Unhealthy);

        // Recovery needs two consecutive successes.
        provider.set_healthy(true);
        monitor.run_probe_round().await;
        assert!(!monitor.is_routable("a"));
        monitor.run_probe_round().await;
        assert!(monitor.is_routable("a"));
        let event = events.try_recv().unwrap();
        assert_eq!(event.to, HealthVerdict::Healthy);
    }

    #[tokio::test]
    async fn failure_streak_interrupted_by_success_resets() {
        let (monitor, provider) = setup(3, 2);

        provider.set_healthy(false);
        monitor.run_probe_round().await;
        monitor.run_probe_round().await;
        provider.set_healthy(true);
        monitor.run_probe_round().await;
        provider.set_healthy(false);
        monitor.run_probe_round().await;
        monitor.run_probe_round().await;
        // Streak was broken; only two consecutive failures so far.
        assert!(monitor.is_routable("a"));
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let registry = Arc::new(ProviderRegistry::new());
        let provider =
            Arc::new(MockProvider::new("slow").with_latency(Duration::from_millis(200)));
        registry
            .register(provider.clone() as Arc<dyn Provider>)
            .unwrap();
        let monitor = HealthMonitor::new(
            registry,
            HealthConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_millis(50),
                failure_threshold: 1,
                success_threshold: 1,
            },
        )
        .unwrap();

        monitor.run_probe_round().await;
        assert!(!monitor.is_routable("slow"));
        assert_eq!(monitor.get("slow").unwrap().status_detail, "probe timeout");
    }

    #[tokio::test]
    async fn start_rejects_second_start_and_stop_is_idempotent() {
        let (monitor, _provider) = setup(3, 2);
        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(MonitorError::AlreadyStarted)));

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        // Restart after stop is allowed.
        monitor.start().unwrap();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn runtime_insert_is_immediately_routable() {
        let (monitor, _provider) = setup(3, 2);
        monitor.insert_provider("late");
        let state = monitor.get("late").unwrap();
        assert_eq!(state.verdict, HealthVerdict::Healthy);
        assert_eq!(state.status_detail, "unknown");
        assert!(monitor.is_routable("late"));

        monitor.remove_provider("late");
        assert!(monitor.get("late").is_none());
    }
}
