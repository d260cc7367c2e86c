//! Retry with exponential backoff for transient exchange errors.
//!
//! Only transient failures (transport, timeout, rate limit) are retried;
//! authentication and ordering rejections pass straight through so a stale
//! sequence value is never resent. Backoff grows exponentially with jitter
//! to keep a fleet of accounts from hammering a recovering venue in step.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ExchangeError;

/// Retry policy for adapter calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Multiplier for exponential growth.
    pub backoff_multiplier: f64,
    /// Jitter factor (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries (for tests and one-shot probes).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Stateful backoff calculator for one retried operation.
#[derive(Debug)]
pub struct BackoffSchedule {
    attempt: u32,
    policy: RetryPolicy,
}

impl BackoffSchedule {
    /// Start a schedule from `policy`.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            policy: policy.clone(),
        }
    }

    /// Next delay, or `None` when attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let exp = self.policy.backoff_multiplier.powi((self.attempt - 1) as i32);
        let base = (self.policy.initial_backoff.as_millis() as f64 * exp)
            .min(self.policy.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(self.apply_jitter(base)))
    }

    /// Random value in [base * (1 - jitter), base * (1 + jitter)].
    fn apply_jitter(&self, base_ms: f64) -> u64 {
        if self.policy.jitter_factor <= 0.0 {
            return base_ms as u64;
        }
        let mut rng = rand::rng();
        let jitter_range = base_ms * self.policy.jitter_factor;
        let min = (base_ms - jitter_range).max(0.0);
        let max = base_ms + jitter_range;
        rng.random_range(min..=max) as u64
    }
}

/// Run `call` under `policy`, retrying transient errors with backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut schedule = BackoffSchedule::new(policy);
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match schedule.next_backoff() {
                Some(delay) => {
                    warn!(
                        operation,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transient exchange error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_exhausts() {
        let mut schedule = BackoffSchedule::new(&fast_policy(4));
        let first = schedule.next_backoff().unwrap();
        let second = schedule.next_backoff().unwrap();
        let third = schedule.next_backoff().unwrap();
        assert!(second >= first);
        assert!(third >= second);
        assert!(schedule.next_backoff().is_none());
    }

    #[test]
    fn test_backoff_respects_ceiling() {
        let mut schedule = BackoffSchedule::new(&fast_policy(10));
        let mut last = Duration::ZERO;
        while let Some(delay) = schedule.next_backoff() {
            last = delay;
        }
        assert!(last <= Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "probe", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Timeout("slow venue".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(5), "send", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::SequenceRejected { sequence: 9 }) }
        })
        .await;
        assert!(matches!(
            result,
            Err(ExchangeError::SequenceRejected { sequence: 9 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<(), _> = with_retry(&fast_policy(2), "probe", || async {
            Err(ExchangeError::Transport("reset".into()))
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Transport(_))));
    }
}
