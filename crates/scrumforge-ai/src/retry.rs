//! Bounded retries with exponential backoff
//!
//! Each attempt runs through the target's circuit breaker. Non-retryable
//! errors and open circuits end the loop on first occurrence; transient
//! errors are retried after `min(base_delay * 2^(attempt-1), max_delay)`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;

/// Retry limits and backoff shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set delay after the first failed attempt
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set backoff cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay to wait after the given 1-based attempt fails
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs provider calls under breaker protection with bounded retries
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    policy: RetryPolicy,
}

impl RetryingExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute with the policy's `max_retries`
    pub async fn execute<F, Fut, T>(&self, breaker: &CircuitBreaker, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retries(breaker, self.policy.max_retries, operation)
            .await
    }

    /// Execute with an explicit attempt budget. A budget of zero still makes
    /// one attempt.
    pub async fn execute_with_retries<F, Fut, T>(
        &self,
        breaker: &CircuitBreaker,
        max_retries: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_retries.max(1);
        let mut attempt = 1;

        loop {
            let err = match breaker.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(
                    target_name = breaker.name(),
                    attempt,
                    error = %err,
                    "Not retrying"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(
                    target_name = breaker.name(),
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                target_name = breaker.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
