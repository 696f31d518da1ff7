// Copyright 2026 MerchFlow Contributors

//! Circuit breaker for async operations
//!
//! Guards any async operation behind the classic three-state machine:
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN --(cooldown elapsed)--> HALF_OPEN
//! HALF_OPEN --(success_threshold successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! Operations run under a bounded timeout; a timeout counts as a failure.
//! When a fallback is supplied it absorbs both open-circuit rejections and
//! operation failures, so infrastructure errors never propagate.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are rejected without touching the guarded resource.
    Open,
    /// Probing whether the resource recovered.
    HalfOpen,
}

/// Per-instance breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED that open the circuit.
    pub failure_threshold: u32,
    /// Time spent OPEN before probing with HALF_OPEN.
    pub cooldown: Duration,
    /// Consecutive successes in HALF_OPEN that close the circuit.
    pub success_threshold: u32,
    /// Upper bound on a single guarded operation.
    pub max_op_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
            max_op_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Total calls attempted through the breaker.
    pub total_calls: u64,
    /// Total failed calls.
    pub total_failures: u64,
    /// Fraction of calls that succeeded.
    pub success_rate: f64,
    /// Rolling failure count in the current state.
    pub current_failures: u32,
    /// Rolling success count in HALF_OPEN.
    pub current_successes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
}

/// A named circuit breaker guarding one resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(breaker = %name, ?config, "circuit breaker initialized");
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                total_calls: 0,
                total_failures: 0,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing OPEN to HALF_OPEN when the cooldown has
    /// elapsed.
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.advance_state(&mut inner);
        inner.state
    }

    /// Run `op` under the breaker. Rejected with [`Error::CircuitOpen`]
    /// while OPEN; failures and timeouts are recorded and propagated.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit().await? {
            return Err(Error::CircuitOpen {
                name: self.name.clone(),
            });
        }
        self.run_admitted(op).await
    }

    /// Run `op` under the breaker, routing open-circuit rejections and
    /// failures to `fallback`. The fallback result is returned as-is and is
    /// never recorded against the breaker.
    pub async fn call_with_fallback<F, Fut, G, GFut, T>(&self, op: F, fallback: G) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.admit().await {
            Ok(true) => match self.run_admitted(op).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    debug!(breaker = %self.name, %err, "guarded call failed, using fallback");
                    fallback().await
                }
            },
            _ => {
                debug!(breaker = %self.name, "circuit open, using fallback");
                fallback().await
            }
        }
    }

    /// Whether a call may proceed. Counts the call attempt.
    async fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.total_calls += 1;
        self.advance_state(&mut inner);
        if inner.state == CircuitState::Open {
            warn!(breaker = %self.name, "circuit is OPEN, rejecting call");
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_admitted<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = tokio::time::timeout(self.config.max_op_timeout, op()).await;
        match outcome {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure().await;
                Err(err)
            }
            Err(_) => {
                self.record_failure().await;
                Err(Error::Timeout(self.config.max_op_timeout))
            }
        }
    }

    /// Advance OPEN to HALF_OPEN once the cooldown has elapsed.
    fn advance_state(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if elapsed {
                info!(breaker = %self.name, "transitioning to HALF_OPEN");
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "recovered, transitioning to CLOSED");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Closed => {
                // A success interrupts any failure streak.
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, transitioning to OPEN"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "failed while HALF_OPEN, back to OPEN");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current statistics.
    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        let success_rate = if inner.total_calls > 0 {
            (inner.total_calls - inner.total_failures) as f64 / inner.total_calls as f64
        } else {
            0.0
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            success_rate,
            current_failures: inner.failure_count,
            current_successes: inner.success_count,
        }
    }

    /// Reset to CLOSED and zero every counter.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        info!(breaker = %self.name, "manually reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.total_calls = 0;
        inner.total_failures = 0;
        inner.last_failure = None;
    }

    /// Force the breaker OPEN as if a failure streak just occurred.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Open;
        inner.last_failure = Some(Instant::now());
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            success_threshold: 2,
            max_op_timeout: Duration::from_millis(200),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(Error::Generic("boom".into())) })
            .await
            .map(|_| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<i32> {
        breaker.call(|| async { Ok(42) }).await
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..2 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_running_op() {
        let breaker = CircuitBreaker::new("test", quick_config());
        breaker.force_open().await;
        let result = breaker.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn cooldown_elapses_into_half_open_then_closes() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak_in_closed() {
        let breaker = CircuitBreaker::new("test", quick_config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Streak was broken, so the circuit must still be closed.
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            max_op_timeout: Duration::from_millis(20),
            ..quick_config()
        };
        let breaker = CircuitBreaker::new("slow", config);
        let result: Result<()> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        let stats = breaker.stats().await;
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test]
    async fn fallback_absorbs_open_circuit_and_failures() {
        let breaker = CircuitBreaker::new("test", quick_config());
        let value = breaker
            .call_with_fallback(
                || async { Err::<i32, _>(Error::Generic("down".into())) },
                || async { Ok(-1) },
            )
            .await
            .unwrap();
        assert_eq!(value, -1);

        breaker.force_open().await;
        let value = breaker
            .call_with_fallback(|| async { Ok(7) }, || async { Ok(-2) })
            .await
            .unwrap();
        assert_eq!(value, -2);
    }

    #[tokio::test]
    async fn stats_report_rates_and_reset_clears() {
        let breaker = CircuitBreaker::new("test", quick_config());
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let stats = breaker.stats().await;
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);

        breaker.reset().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }
}
