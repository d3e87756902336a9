//! Three-state circuit breaker guarding outbound hub calls.
//!
//! Closed passes calls through, open fails fast, half-open admits probes.
//! State observation in half-open is racy by design; every mutation is
//! serialized under a single lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip closed -> open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that restore open -> closed.
    pub success_threshold: u32,
    /// Time the circuit stays open before admitting probes.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of breaker counters for diagnostics.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition: Instant,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
}

/// Circuit breaker; one instance per protected endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Transitions open -> half-open when the open timeout has elapsed.
    /// Returns `false` while the circuit is open.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= self.config.open_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.last_transition = Instant::now();
            inner.failure_count = 0;
            inner.success_count = 0;
        }
        inner.state != CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.last_transition = Instant::now();
                inner.success_count = 0;
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        match inner.state {
            // Any failure during a probe window reopens the circuit.
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_transition = Instant::now();
                inner.success_count = 0;
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_transition = Instant::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_transition: inner.last_transition,
        }
    }

    /// Clear counters and force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_transition = Instant::now();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
