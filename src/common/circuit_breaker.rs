//! Circuit Breaker pattern implementation for venue fault tolerance
//!
//! Each venue gets one breaker; outbound gateway calls pass through it so a
//! failing venue stops producing requests from this replica until it has
//! demonstrably recovered.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Venue is failing, requests are rejected with a retry-after
//! - HalfOpen: Probing recovery, a bounded number of calls admitted

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    #[default]
    Closed,
    /// Venue is failing - requests are rejected immediately
    Open,
    /// Probing recovery - up to `half_open_max_calls` admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u32,
    /// Duration in Open before the next call probes HalfOpen
    pub reset_timeout: Duration,
    /// Concurrent calls admitted while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
    total_rejections: u64,
    total_failures: u64,
}

/// Point-in-time breaker metrics for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub retry_after_secs: u64,
}

/// Circuit breaker guarding one venue. Interior-mutable so the gateway can
/// share a single instance across tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Remaining time until an Open circuit will admit a probe call.
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        match inner.last_failure_time {
            Some(at) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Check whether a call may proceed. Open circuits lazily transition
    /// to HalfOpen once `reset_timeout` has elapsed since the last failure;
    /// HalfOpen admits up to `half_open_max_calls` concurrent probes.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == CircuitState::Open {
            let elapsed_enough = inner
                .last_failure_time
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if elapsed_enough {
                tracing::info!(venue = %self.name, "circuit transitioning to half-open");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                inner.success_count = 0;
            }
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.total_rejections += 1;
                false
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    inner.total_rejections += 1;
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(venue = %self.name, "circuit closed, venue recovered");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                    inner.last_failure_time = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Any failure while HalfOpen re-opens the
    /// circuit immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        venue = %self.name,
                        failures = inner.failure_count,
                        retry_secs = self.config.reset_timeout.as_secs(),
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(venue = %self.name, "circuit re-opened during recovery probe");
                inner.state = CircuitState::Open;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Reset to the initial closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = BreakerState::default();
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().unwrap();
        let retry_after = match inner.last_failure_time {
            Some(at) if inner.state == CircuitState::Open => self
                .config
                .reset_timeout
                .saturating_sub(at.elapsed())
                .as_secs(),
            _ => 0,
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state.as_str(),
            failure_count: inner.failure_count,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            retry_after_secs: retry_after,
        }
    }
}

/// Process-local registry handing out one breaker per venue. Breaker state
/// is intentionally not synchronized across replicas; each replica decides
/// independently when to probe a venue.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn for_venue(&self, venue: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(venue.to_lowercase())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    venue.to_lowercase(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let breakers = self.breakers.lock().unwrap();
        breakers.values().map(|b| b.metrics()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::with_defaults("binance");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_failure_threshold_opens_circuit() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("binance", config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.time_until_retry() > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("binance", config);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admission_is_bounded() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_half_open_max_calls(2)
            .with_reset_timeout(Duration::from_millis(1));
        let cb = CircuitBreaker::new("bybit", config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));

        // First call probes and transitions to HalfOpen
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second probe admitted, third rejected
        assert!(cb.can_execute());
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(1));
        let cb = CircuitBreaker::new("bybit", config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(1));
        let cb = CircuitBreaker::new("bybit", config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let cb = CircuitBreaker::new("binance", config);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_registry_hands_out_one_breaker_per_venue() {
        let registry = BreakerRegistry::default();
        let a = registry.for_venue("Binance");
        let b = registry.for_venue("binance");
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure();
        assert_eq!(registry.all_metrics().len(), 1);
        assert_eq!(registry.all_metrics()[0].total_failures, 1);
    }
}
