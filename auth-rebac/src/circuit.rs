//! Circuit breaker around the cache's revision backing store.
//!
//! Closed → Open after `failure_threshold` consecutive failures, Open →
//! HalfOpen once `break_duration` has elapsed, HalfOpen → Closed after
//! `success_threshold` successes. Any failure while half-open re-opens.

use crate::{
    config::CircuitBreakerConfig,
    error::{RebacError, Result},
};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests fail immediately
    Open,
    /// A limited number of trial requests test for recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about circuit breaker state
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub half_open_calls: usize,
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub last_state_change: Instant,
}

struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    half_open_calls: usize,
    rejected_calls: u64,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    /// Bumped on every transition so late results from a previous state are ignored.
    generation: u64,
}

impl BreakerState {
    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        match next {
            CircuitState::Open => warn!("Revision store circuit breaker opening"),
            CircuitState::HalfOpen => info!("Revision store circuit breaker entering half-open state"),
            CircuitState::Closed => info!("Revision store circuit breaker closing"),
        }
        metrics::counter!("rebac_circuit_transitions_total", "to" => next.as_str()).increment(1);
        self.state = next;
        self.last_state_change = Instant::now();
        self.generation += 1;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_calls = 0;
    }
}

pub struct CircuitBreaker {
    failure_threshold: usize,
    success_threshold: usize,
    half_open_max_calls: usize,
    break_duration: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            half_open_max_calls: config.half_open_max_calls.max(1),
            break_duration: config.break_duration(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                rejected_calls: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
                generation: 0,
            }),
        }
    }

    /// Current state, promoting Open to HalfOpen once the break has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote(&mut inner);
        inner.state
    }

    fn promote(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open && inner.last_state_change.elapsed() >= self.break_duration
        {
            inner.transition(CircuitState::HalfOpen);
        }
    }

    /// Admit a call, returning the generation its result must be recorded against.
    fn admit(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.promote(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(inner.generation),
            CircuitState::HalfOpen if inner.half_open_calls < self.half_open_max_calls => {
                inner.half_open_calls += 1;
                Ok(inner.generation)
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected_calls += 1;
                metrics::counter!("rebac_circuit_rejected_total").increment(1);
                Err(RebacError::CircuitOpen)
            }
        }
    }

    fn record_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.transition(CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.last_failure_time = None;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => inner.transition(CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Execute an operation through the circuit breaker
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.admit()?;
        let result = operation().await;
        match result {
            Ok(_) => self.record_success(generation),
            Err(_) => self.record_failure(generation),
        }
        result
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.promote(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            last_state_change: inner.last_state_change,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn breaker(failures: usize, break_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: 2,
            half_open_max_calls: 3,
            break_duration_ms: break_ms,
        })
    }

    async fn fail(cb: &CircuitBreaker) {
        let _: Result<()> = cb
            .call(|| async { Err(RebacError::Storage("down".to_string())) })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 60_000);
        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok("should not execute") }).await;
        assert_eq!(result, Err(RebacError::CircuitOpen));
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60_000);
        fail(&cb).await;
        fail(&cb).await;
        cb.call(|| async { Ok(()) }).await.unwrap();
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let cb = breaker(2, 50);
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        for _ in 0..2 {
            cb.call(|| async { Ok(()) }).await.unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 50);
        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
