//! # Retry Manager
//!
//! Bounded exponential backoff with jitter around retryable operations.
//! The wait before attempt `k` (k ≥ 2) is
//! `min(base_delay · backoff_factor^(k−1), max_delay)` with ±10% uniform
//! jitter, raised to any explicit `retry_after` the last error carried.
//! Cancellation during a wait or an attempt aborts immediately.

use crate::error::{ClassifiedError, ErrorCategory};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; zero means one attempt only
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Error categories eligible for retry
    pub retryable_categories: HashSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retryable_categories: HashSet::from([
                ErrorCategory::RateLimit,
                ErrorCategory::Network,
                ErrorCategory::Server,
                ErrorCategory::Timeout,
            ]),
        }
    }
}

impl RetryPolicy {
    fn eligible(&self, error: &ClassifiedError) -> bool {
        error.retryable && self.retryable_categories.contains(&error.category)
    }

    /// Backoff before attempt `k` (k ≥ 2), without jitter.
    fn backoff_for_attempt(&self, k: u32) -> Duration {
        let factor = self.backoff_factor.powi(k.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// Aggregate retry statistics. Hot counters are atomic; the moving-average
/// attempts per operation sits behind a mutex.
#[derive(Debug, Default)]
pub struct RetryStats {
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    average: Mutex<AverageState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct AverageState {
    operations: u64,
    attempts: u64,
}

/// Read-only view of the retry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatsSnapshot {
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub average_attempts_per_operation: f64,
}

impl RetryStats {
    fn record_operation(&self, attempts: u64) {
        let mut average = self.average.lock().unwrap();
        average.operations += 1;
        average.attempts += attempts;
    }

    pub fn snapshot(&self) -> RetryStatsSnapshot {
        let average = *self.average.lock().unwrap();
        RetryStatsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            average_attempts_per_operation: if average.operations == 0 {
                0.0
            } else {
                average.attempts as f64 / average.operations as f64
            },
        }
    }
}

pub struct RetryManager {
    policy: RetryPolicy,
    stats: RetryStats,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, stats: RetryStats::default() }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait to apply before attempt `k` (k ≥ 2): the policy backoff with
    /// ±10% jitter, raised to at least the error's explicit `retry_after`.
    pub fn delay_before_attempt(&self, k: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.policy.backoff_for_attempt(k);
        let jitter = 0.9 + rand::thread_rng().gen::<f64>() * 0.2;
        let mut delay = Duration::from_secs_f64(backoff.as_secs_f64() * jitter);
        if let Some(floor) = retry_after {
            delay = delay.max(floor);
        }
        delay
    }

    /// Drive `operation` with retries. The closure receives the attempt
    /// number, starting at 1. Retries happen only for eligible errors and
    /// while the attempt count has not exceeded `max_retries`; cancellation
    /// aborts during waits and between attempts.
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if ctx.is_cancelled() {
                self.stats.record_operation(u64::from(attempt.saturating_sub(1)));
                return Err(ClassifiedError::cancelled("retry", "execute"));
            }
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        self.stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    self.stats.record_operation(u64::from(attempt));
                    return Ok(value);
                }
                Err(error) => {
                    if !self.policy.eligible(&error) || attempt > self.policy.max_retries {
                        if attempt > 1 {
                            self.stats.failed_retries.fetch_add(1, Ordering::Relaxed);
                        }
                        self.stats.record_operation(u64::from(attempt));
                        return Err(error);
                    }

                    let next = attempt + 1;
                    let delay = self.delay_before_attempt(next, error.retry_after);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        category = error.category.as_str(),
                        "retrying after backoff"
                    );
                    self.stats.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            self.stats.record_operation(u64::from(attempt));
                            return Err(ClassifiedError::cancelled("retry", "execute"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
            }
        }
    }
}
