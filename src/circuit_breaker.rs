//! Circuit breaker with lock-free state transitions.
//!
//! Failures are only counted when their [`ErrorKind`] matches the breaker's
//! `expected_errors` list (an empty list counts everything). Unexpected
//! errors pass through without moving the breaker.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::{Clock, WallTime};
use crate::error::{Error, ErrorKind};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    /// Failures further apart than this window do not accumulate.
    pub monitoring_period: Duration,
    /// Kinds that count towards the threshold; empty counts everything.
    pub expected_errors: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
            expected_errors: Vec::new(),
        }
    }
}

/// Point-in-time view of a breaker, exposed via health/metrics surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub last_failure_at_ms: Option<u64>,
    pub next_attempt_at_ms: Option<u64>,
}

struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    last_failure_millis: AtomicU64,
    opened_at_millis: AtomicU64,
    half_open_probes: AtomicUsize,
}

impl BreakerState {
    fn new() -> Self {
        BreakerState {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            success_count: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(u64::MAX),
            opened_at_millis: AtomicU64::new(0),
            half_open_probes: AtomicUsize::new(0),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            state: Arc::new(BreakerState::new()),
            clock: Arc::new(WallTime),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Reset to closed, clearing all counters.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.half_open_probes.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.last_failure_millis.store(u64::MAX, Ordering::Release);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let last_failure = self.state.last_failure_millis.load(Ordering::Acquire);
        let state = self.current_state();
        let next_attempt = match state {
            CircuitState::Open => Some(
                self.state.opened_at_millis.load(Ordering::Acquire)
                    + self.config.recovery_timeout.as_millis() as u64,
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            success_count: self.state.success_count.load(Ordering::Acquire),
            last_failure_at_ms: (last_failure != u64::MAX).then_some(last_failure),
            next_attempt_at_ms: next_attempt,
        }
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let recovery = self.config.recovery_timeout.as_millis() as u64;

                    if elapsed >= recovery {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(breaker = %self.name, "circuit breaker -> half-open");
                                self.state.half_open_probes.store(1, Ordering::Release);
                                break;
                            }
                            // Someone else transitioned; re-evaluate.
                            Err(_) => continue,
                        }
                    } else {
                        return Err(self.open_error(recovery.saturating_sub(elapsed)));
                    }
                }
                STATE_HALF_OPEN => {
                    // One probe at a time while half-open.
                    let probes = self.state.half_open_probes.fetch_add(1, Ordering::AcqRel);
                    if probes >= 1 {
                        self.state.half_open_probes.fetch_sub(1, Ordering::Release);
                        return Err(self.open_error(0));
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;
        if was_half_open {
            self.state.half_open_probes.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(error) => {
                if self.counts(error) {
                    self.on_failure();
                }
            }
        }

        result
    }

    fn counts(&self, error: &Error) -> bool {
        self.config.expected_errors.is_empty()
            || self.config.expected_errors.contains(&error.kind())
    }

    fn open_error(&self, retry_after_millis: u64) -> Error {
        Error::CircuitOpen {
            name: self.name.clone(),
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            retry_after: Duration::from_millis(retry_after_millis),
        }
    }

    fn on_success(&self) {
        self.state.success_count.fetch_add(1, Ordering::AcqRel);
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(breaker = %self.name, "circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        let previous = self.state.last_failure_millis.swap(now, Ordering::AcqRel);

        // Failures outside the monitoring window start a fresh streak.
        let window = self.config.monitoring_period.as_millis() as u64;
        if previous != u64::MAX && now.saturating_sub(previous) > window {
            self.state.failure_count.store(0, Ordering::Release);
        }

        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::warn!(breaker = %self.name, failures, "half-open probe failed -> open");
                }
            }
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::error!(
                        breaker = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker -> open"
                    );
                }
            }
            _ => {}
        }
    }
}
