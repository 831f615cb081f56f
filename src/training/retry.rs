//! Bounded retry with exponential backoff
//!
//! Each policy retries exactly one fault class. Anything else is returned to
//! the caller on the first failure.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::{BackoffConfig, RetryConfig};
use crate::error::{FaultClass, Result, SpiceError};

/// Retry one call expression according to a [`RetryPolicy`]
///
/// The expression is re-evaluated on every attempt, so unlike
/// [`RetryPolicy::run`] it may borrow a session or provider mutably.
macro_rules! with_retry {
    ($policy:expr, $operation:expr, $call:expr) => {{
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match $call.await {
                Ok(value) => break Ok(value),
                Err(e) if $policy.should_retry(&e, attempt) => {
                    let delay = $policy.backoff_duration(attempt - 1);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        $operation,
                        attempt,
                        $policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

pub(crate) use with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Fault class this policy retries
    pub retry_on: FaultClass,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig, retry_on: FaultClass) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            retry_on,
        }
    }

    /// Single attempt, no retry
    pub fn none(retry_on: FaultClass) -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            retry_on,
        }
    }

    /// Delay before retry number `retry` (zero-based): `base * 2^retry`, capped
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether a failure on attempt `attempt` (one-based) should be retried
    pub fn should_retry(&self, error: &SpiceError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.fault_class() == self.retry_on
    }

    /// Run `operation` until it succeeds, fails permanently or attempts run out
    ///
    /// The closure is called once per attempt, so it must not hold a mutable
    /// borrow across calls; step-level calls on a session use
    /// [`should_retry`](Self::should_retry) directly.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.backoff_duration(attempt - 1);
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        operation, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Policies the orchestrator hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    /// Trainer calls and connector reads
    pub transient: RetryPolicy,
    /// Run record commits
    pub registry: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            transient: RetryPolicy::new(config.transient, FaultClass::Transient),
            registry: RetryPolicy::new(config.registry, FaultClass::Registry),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
