//! Per-provider circuit breakers
//!
//! One breaker exists per named target (normally one per provider). A breaker
//! starts `Closed`, opens after `failure_threshold` consecutive failures,
//! rejects calls until `reset_timeout` has elapsed, then lets the next call
//! through in `HalfOpen`. `success_threshold` consecutive successes close it
//! again; any failure while half-open reopens it.
//!
//! Breaker state is process-local. Replicas of the host service each keep
//! their own breakers and do not share open/closed decisions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AiError, Result};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow through normally
    Closed,
    /// Requests fail immediately
    Open,
    /// Requests flow through to probe recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before opening
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before closing
    pub success_threshold: u32,
    /// Time spent `Open` before a probe is allowed
    #[serde(with = "crate::config::duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set time spent open before a trial call
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Internal state tracking
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_retry_at: None,
        }
    }
}

/// Point-in-time view of a breaker, for metrics export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Circuit breaker guarding one named target
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under breaker protection.
    ///
    /// Returns [`AiError::CircuitOpen`] without invoking `operation` while the
    /// breaker is open and the reset timeout has not elapsed.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            return Err(AiError::CircuitOpen(self.name.clone()));
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Decide whether a call may proceed, moving `Open` to `HalfOpen` once
    /// the retry time has passed
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = state
                    .next_retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if ready {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(breaker = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                }
                ready
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                debug!(
                    breaker = %self.name,
                    successes = state.success_count,
                    threshold = self.config.success_threshold,
                    "Circuit breaker HALF_OPEN success"
                );
                if state.success_count >= self.config.success_threshold {
                    *state = BreakerState::default();
                    info!(breaker = %self.name, "Circuit breaker recovered, transitioning to CLOSED");
                }
            }
            CircuitState::Open => {
                // a probe that started before a concurrent failure reopened us
                debug!(breaker = %self.name, "Ignoring success recorded while OPEN");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.failure_count += 1;
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                debug!(
                    breaker = %self.name,
                    failures = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure"
                );
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.next_retry_at = Some(now + self.config.reset_timeout);
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.next_retry_at = Some(now + self.config.reset_timeout);
                state.success_count = 0;
                warn!(breaker = %self.name, "Circuit breaker reopened after failure in HALF_OPEN");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit open, as if it had just tripped
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.success_count = 0;
        state.next_retry_at = Some(Instant::now() + self.config.reset_timeout);
        info!(breaker = %self.name, "Circuit breaker force opened");
    }

    /// Force `Closed` with all counters zeroed
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
        debug!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Stored state. An `Open` breaker whose timeout has passed stays `Open`
    /// here until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.state.lock().success_count
    }

    /// When the last failure was recorded
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.state.lock().last_failure_at
    }

    /// Earliest moment an open breaker admits a probe
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.state.lock().next_retry_at
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
        }
    }
}

/// Lazily populated map of breakers by name
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    /// Get the breaker for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())));
        Arc::clone(breaker.value())
    }

    /// Install a breaker with its own config, replacing any existing one
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|breaker| breaker.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_reset_timeout(Duration::from_millis(reset_ms)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(AiError::transient("boom")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let cb = breaker(3, 1, 1_000);
        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(AiError::CircuitOpen("test".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 1_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(succeed(&cb).await, Ok(7));
        assert_eq!(cb.failure_count(), 0);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_recovers() {
        let cb = breaker(2, 2, 1_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(succeed(&cb).await, Err(AiError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(succeed(&cb).await, Ok(7));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);

        assert_eq!(succeed(&cb).await, Ok(7));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 3, 500);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(500)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.success_count(), 0);

        // the reopen pushed the retry time forward again
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(matches!(succeed(&cb).await, Err(AiError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, 1, 60_000);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.next_retry_at().is_none());
        assert_eq!(succeed(&cb).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        cb.force_open();
        assert!(matches!(succeed(&cb).await, Err(AiError::CircuitOpen(_))));
    }

    #[test]
    fn test_registry_shares_breaker_per_name() {
        let registry = CircuitBreakerRegistry::new();
        let cb1 = registry.get_or_create("openai");
        let cb2 = registry.get_or_create("openai");
        let cb3 = registry.get_or_create("anthropic");

        assert!(Arc::ptr_eq(&cb1, &cb2));
        assert!(!Arc::ptr_eq(&cb1, &cb3));
    }

    #[test]
    fn test_registry_snapshots_are_sorted() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("openai").record_failure();
        registry.get_or_create("anthropic");

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "anthropic");
        assert_eq!(snapshots[1].name, "openai");
        assert_eq!(snapshots[1].failure_count, 1);
        assert_eq!(snapshots[1].state, CircuitState::Closed);
    }

    #[test]
    fn test_registry_register_overrides_config() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        registry.register("fragile", config.clone());
        assert_eq!(registry.get_or_create("fragile").config(), &config);
    }

    #[test]
    fn test_snapshot_serializes_state_names() {
        let snapshot = BreakerSnapshot {
            name: "openai".to_string(),
            state: CircuitState::HalfOpen,
            failure_count: 0,
            success_count: 1,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "HALF_OPEN");
    }
}
