//! Bounded retry with exponential backoff and jitter.
//!
//! Every slow boundary call in the pipeline goes through [`retry`] with its
//! own [`RetryPolicy`], so fetch, classify, tag and notify back off
//! independently of each other.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Retry policy for a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Randomize each delay within [50%, 100%] of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// A policy with a single attempt.
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Nominal (un-jittered) delay after `attempt` failed attempts.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }

    /// Delay to sleep after `attempt` failed attempts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let nanos = u64::try_from(nominal.as_nanos()).unwrap_or(u64::MAX);
        let low = nanos / 2;
        let jittered = rand::thread_rng().gen_range(low..=nanos);
        Duration::from_nanos(jittered)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    /// Number of calls made.
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    is_retryable: R,
) -> Attempted<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if attempt < max && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}
