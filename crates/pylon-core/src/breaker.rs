//! Circuit breaker guarding calls into external dependencies.
//!
//! One breaker instance protects one dependency (identity provider, shared
//! store). State is process-local and never persisted.
//!
//! States: CLOSED (calls proceed, failures counted), OPEN (calls rejected
//! without invoking the wrapped function), HALF_OPEN (a single trial call
//! allowed). CLOSED moves to OPEN when the failure counter reaches
//! `fail_max`; OPEN moves to HALF_OPEN after `recovery_timeout`; the trial
//! call decides between CLOSED and OPEN. Every guarded call carries a
//! bounded timeout, and exceeding it counts as a failure.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Dependency considered down; calls are rejected immediately.
    Open,
    /// Probing recovery with a single trial call.
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

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub fail_max: u32,
    /// Time spent OPEN before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Upper bound on each guarded call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Error returned by a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Circuit is open; the wrapped function was not invoked.
    #[error("Dependency unavailable: circuit open")]
    Open,

    /// The wrapped call exceeded the configured timeout.
    #[error("Dependency call timed out")]
    Timeout,

    /// The wrapped call itself failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A circuit breaker for a single dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker named after the dependency it protects.
    #[must_use]
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Name of the protected dependency.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failures
    }

    /// Run a fallible call through the breaker.
    ///
    /// In OPEN the function is never invoked and [`BreakerError::Open`] is
    /// returned immediately. Timeouts and inner errors both count as
    /// failures toward `fail_max`.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] when short-circuited,
    /// [`BreakerError::Timeout`] when the call exceeds `call_timeout`, or
    /// [`BreakerError::Inner`] wrapping the call's own error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            debug!(dependency = self.name, "Circuit open, rejecting call");
            return Err(BreakerError::Open);
        }

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Decide whether a call may proceed, transitioning OPEN to HALF_OPEN
    /// once the recovery timeout has elapsed.
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    info!(dependency = self.name, "Circuit transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // Only one trial call probes the dependency at a time.
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(dependency = self.name, "Circuit closing after successful trial");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.fail_max {
                    warn!(
                        dependency = self.name,
                        failures = inner.failures,
                        timeout_secs = self.config.recovery_timeout.as_secs(),
                        "Circuit opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(dependency = self.name, "Circuit reopening after failed trial");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }
}
