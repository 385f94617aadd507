//! Circuit breaker and keyed registry.
//!
//! A per-key consecutive-failure state machine (Closed/Open/HalfOpen) with
//! an explicit half-open probe limit, backed by a process-wide registry so
//! every distinct call target (e.g. one per outbound HTTP host) gets its
//! own breaker rather than sharing a single global instance.

use common::config::CircuitBreakerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("too many concurrent half-open probes")]
    TooManyRequests,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_inflight: 0,
            half_open_successes: 0,
        }
    }
}

/// Successes required while half-open before transitioning back to closed.
const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 1;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Breaker>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, inner: RwLock::new(Breaker::default()) }
    }

    /// Admission check + half-open probe bookkeeping. Call before running the
    /// guarded operation; on `Ok(())` you must later call
    /// [`Self::record_success`] or [`Self::record_failure`].
    pub async fn admit(&self) -> Result<(), CircuitBreakerError> {
        let mut breaker = self.inner.write().await;
        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.timeout_ms) {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.half_open_inflight = 1;
                    breaker.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitBreakerError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_inflight < self.config.max_requests {
                    breaker.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(CircuitBreakerError::TooManyRequests)
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut breaker = self.inner.write().await;
        breaker.consecutive_failures = 0;
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.half_open_inflight = breaker.half_open_inflight.saturating_sub(1);
                breaker.half_open_successes += 1;
                if breaker.half_open_successes >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                    breaker.state = CircuitState::Closed;
                    breaker.opened_at = None;
                    breaker.half_open_successes = 0;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // A late success racing a timeout transition; treat as closed.
                breaker.state = CircuitState::Closed;
                breaker.opened_at = None;
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut breaker = self.inner.write().await;
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.half_open_inflight = breaker.half_open_inflight.saturating_sub(1);
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.consecutive_failures = self.config.max_failures;
            }
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.max_failures {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn reset(&self) {
        let mut breaker = self.inner.write().await;
        *breaker = Breaker::default();
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Process-wide keyed registry, e.g. `"http:<url>"`.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(key) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub async fn reset(&self) {
        for breaker in self.breakers.read().await.values() {
            breaker.reset().await;
        }
    }

    pub async fn get_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let mut stats = HashMap::new();
        for (key, breaker) in self.breakers.read().await.iter() {
            let inner = breaker.inner.read().await;
            stats.insert(
                key.clone(),
                CircuitBreakerStats {
                    state: inner.state,
                    consecutive_failures: inner.consecutive_failures,
                },
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_failures: u32, timeout_ms: u64, max_requests: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { max_failures, timeout_ms, max_requests, sliding_window_size: 10 }
    }

    #[tokio::test]
    async fn opens_after_max_failures_and_rejects() {
        let cb = CircuitBreaker::new(config(3, 10_000, 1));
        for _ in 0..3 {
            cb.admit().await.unwrap();
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.admit().await, Err(CircuitBreakerError::CircuitOpen));
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new(config(1, 10, 1));
        cb.admit().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cb.admit().await.unwrap();
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(config(1, 10, 1));
        cb.admit().await.unwrap();
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cb.admit().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = CircuitBreaker::new(config(1, 10, 1));
        cb.admit().await.unwrap();
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        cb.admit().await.unwrap(); // first probe admitted, transitions to half-open
        assert_eq!(cb.admit().await, Err(CircuitBreakerError::TooManyRequests));
    }

    #[tokio::test]
    async fn registry_creates_lazily_and_keys_independently() {
        let registry = CircuitBreakerRegistry::new(config(1, 10_000, 1));
        let a = registry.get("http://a").await;
        let b = registry.get("http://b").await;

        a.admit().await.unwrap();
        a.record_failure().await;
        assert_eq!(a.state().await, CircuitState::Open);
        assert_eq!(b.state().await, CircuitState::Closed);

        let stats = registry.get_stats().await;
        assert_eq!(stats.len(), 2);
    }

    #[tokio::test]
    async fn registry_reset_clears_all_breakers() {
        let registry = CircuitBreakerRegistry::new(config(1, 10_000, 1));
        let a = registry.get("http://a").await;
        a.admit().await.unwrap();
        a.record_failure().await;
        assert_eq!(a.state().await, CircuitState::Open);

        registry.reset().await;
        assert_eq!(a.state().await, CircuitState::Closed);
    }
}
