//! Count-based circuit breaker.
//!
//! There is no timer: an open breaker stays open until something
//! transitions it explicitly (failover forces it open, failback closes it).

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::failover::CircuitBreakerConfig;
use crate::proto::error::{Error, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow and outcomes are recorded.
    Closed,
    /// The failure rate crossed the threshold; calls are denied.
    Open,
    /// Trial calls flow; their outcomes decide between closed and open.
    HalfOpen,
    /// Denied until explicitly closed. Outcomes are not recorded.
    ForcedOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::ForcedOpen => "FORCED_OPEN",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Most recent outcomes, `true` for a failure.
    window: VecDeque<bool>,
}

/// A circuit breaker guarding one endpoint.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let capacity = config.sliding_window_size.max(1);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// The breaker's name (the endpoint name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failure percentage over the window, once enough calls were recorded.
    pub fn failure_rate(&self) -> Option<f32> {
        let inner = self.inner.lock();
        self.rate(&inner.window)
    }

    /// Asks permission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotPermitted`] while open or forced open.
    pub fn try_acquire(&self) -> Result<()> {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open | CircuitState::ForcedOpen => {
                error!(breaker = %self.name, "call not permitted");
                Err(Error::CallNotPermitted {
                    endpoint: self.name.clone(),
                })
            }
        }
    }

    /// Records a successful call.
    pub fn on_success(&self) {
        self.record(false);
    }

    /// Records a failed call according to the configured error classes.
    ///
    /// Ignored classes are not recorded; classes outside `record_on` count
    /// as successes.
    pub fn on_error(&self, err: &Error) {
        let class = err.class();
        if self.config.ignore.contains(&class) {
            return;
        }
        self.record(self.config.record_on.contains(&class));
    }

    /// Closes the breaker and clears its window.
    pub fn transition_to_closed(&self) {
        self.transition(CircuitState::Closed);
    }

    /// Opens the breaker.
    pub fn transition_to_open(&self) {
        self.transition(CircuitState::Open);
    }

    /// Moves the breaker to half-open.
    pub fn transition_to_half_open(&self) {
        self.transition(CircuitState::HalfOpen);
    }

    /// Forces the breaker open until it is explicitly closed.
    pub fn transition_to_forced_open(&self) {
        self.transition(CircuitState::ForcedOpen);
    }

    fn transition(&self, to: CircuitState) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        inner.state = to;
        inner.window.clear();
        drop(inner);
        if from != to {
            warn!(breaker = %self.name, %from, %to, "circuit breaker state transition");
        }
    }

    fn minimum_calls(&self) -> usize {
        let window = self.config.sliding_window_size.max(1);
        self.config
            .minimum_number_of_calls
            .unwrap_or(window)
            .clamp(1, window)
    }

    fn rate(&self, window: &VecDeque<bool>) -> Option<f32> {
        if window.len() < self.minimum_calls() {
            return None;
        }
        let failures = window.iter().filter(|&&failed| failed).count();
        Some(failures as f32 * 100.0 / window.len() as f32)
    }

    fn record(&self, failed: bool) {
        let mut inner = self.inner.lock();
        let state = inner.state;
        if !matches!(state, CircuitState::Closed | CircuitState::HalfOpen) {
            return;
        }
        let size = self.config.sliding_window_size.max(1);
        if inner.window.len() == size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);

        let Some(rate) = self.rate(&inner.window) else {
            return;
        };
        let next = if rate >= self.config.failure_rate_threshold {
            CircuitState::Open
        } else if state == CircuitState::HalfOpen && inner.window.len() == size {
            CircuitState::Closed
        } else {
            return;
        };
        if next == state {
            return;
        }
        inner.state = next;
        inner.window.clear();
        drop(inner);
        if next == CircuitState::Open {
            error!(breaker = %self.name, rate, "failure rate exceeded threshold");
        }
        warn!(breaker = %self.name, from = %state, to = %next, "circuit breaker state transition");
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
