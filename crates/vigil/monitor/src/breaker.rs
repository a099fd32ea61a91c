//! Circuit breaker for collaborator calls.
//!
//! Repeated deep-collect or judge failures open the breaker; while open the
//! call fails fast as a retryable error and the condition stays Active.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::lock;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,

    /// Calls are rejected.
    Open,

    /// Probing whether the collaborator recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding one collaborator.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Collaborator name, for logs and errors.
    name: &'static str,

    inner: Mutex<Inner>,

    config: CircuitBreakerConfig,

    /// Consecutive failures while closed.
    failure_count: AtomicU32,

    /// Consecutive successes while half-open.
    success_count: AtomicU32,

    /// Calls let through while half-open.
    half_open_requests: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            config,
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_requests: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, moving Open to HalfOpen once the reset timeout passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = lock(&self.inner);
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Whether a call may proceed.
    pub fn allow_request(&self) -> bool {
        let mut inner = lock(&self.inner);
        self.check_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let current = self.half_open_requests.fetch_add(1, Ordering::SeqCst);
                current < self.config.half_open_max_requests
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);

        match inner.state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    info!(
                        collaborator = self.name,
                        successes, "Circuit breaker closing after recovery"
                    );
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);

        match inner.state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        collaborator = self.name,
                        failures, "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    collaborator = self.name,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker into a state.
    pub fn force_state(&self, new_state: CircuitState) {
        let mut inner = lock(&self.inner);
        self.transition_to(&mut inner, new_state);
    }

    fn check_timeout(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true);
        if elapsed {
            info!(
                collaborator = self.name,
                "Circuit breaker transitioning to half-open after timeout"
            );
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
                inner.opened_at = None;
            }
            CircuitState::Open => {
                self.success_count.store(0, Ordering::SeqCst);
                self.half_open_requests.store(0, Ordering::SeqCst);
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                self.success_count.store(0, Ordering::SeqCst);
                self.half_open_requests.store(0, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            half_open_max_requests: 2,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("judge", test_config());
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::new("deep_collect", test_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::new("judge", test_config());
        breaker.force_state(CircuitState::Open);
        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("judge", test_config());
        breaker.force_state(CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
