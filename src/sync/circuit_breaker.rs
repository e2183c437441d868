//! Per-source circuit breaker
//!
//! ```text
//! Closed   --failure_count >= threshold-->  Open
//! Open     --reset_timeout elapsed------->  HalfOpen
//! HalfOpen --any success----------------->  Closed
//! HalfOpen --any failure----------------->  Open
//! ```
//!
//! Admission is split in two steps: [`CircuitBreaker::check`] decides
//! whether a request may proceed, and [`CircuitBreaker::record_attempt`]
//! consumes a half-open trial once the request is actually forwarded. A
//! request that passes the breaker but is then refused elsewhere does not
//! burn a trial.

use crate::config::CircuitBreakerConfig;
use crate::error::SyncFailure;
use serde::Serialize;
use tokio::time::Instant;

/// Runtime circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Mutable breaker state for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    /// Consecutive failures since the breaker last closed
    pub failure_count: u32,
    /// Trials forwarded since the breaker went half-open
    pub half_open_attempts: u32,
    /// When the breaker last opened
    pub opened_at: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_attempts: 0,
            opened_at: None,
        }
    }
}

/// Serializable view of a source's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_attempts: u32,
    /// Milliseconds since the breaker opened, while open
    pub open_for_ms: Option<u64>,
}

/// Circuit breaker state machine for one source
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: CircuitBreakerState::default(),
        }
    }

    /// Decide whether a request at `now` may reach the handler
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open
    /// first, and the current request is judged under half-open rules.
    pub fn check(&mut self, now: Instant) -> Result<(), SyncFailure> {
        if self.inner.state == CircuitState::Open {
            let can_try = self
                .inner
                .opened_at
                .map(|opened_at| {
                    now.saturating_duration_since(opened_at) >= self.config.reset_timeout()
                })
                .unwrap_or(true);

            if can_try {
                self.inner.state = CircuitState::HalfOpen;
                self.inner.half_open_attempts = 0;
            }
        }

        match self.inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(SyncFailure::CircuitOpen),
            CircuitState::HalfOpen => {
                if self.inner.half_open_attempts >= self.config.half_open_max_attempts {
                    Err(SyncFailure::HalfOpenCapExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Note that an admitted request was forwarded to the handler
    pub fn record_attempt(&mut self) {
        if self.inner.state == CircuitState::HalfOpen {
            self.inner.half_open_attempts = self.inner.half_open_attempts.saturating_add(1);
        }
    }

    /// Record a successful attempt; returns the state before recording
    ///
    /// An open breaker keeps its cooldown: only closed and half-open
    /// breakers are closed by a success.
    pub fn record_success(&mut self) -> CircuitState {
        let previous = self.inner.state;
        match previous {
            // Late outcome of an attempt admitted before the breaker opened
            CircuitState::Open => {}
            CircuitState::Closed | CircuitState::HalfOpen => self.close(),
        }
        previous
    }

    /// Record a failed attempt; returns true if this failure opened the breaker
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self.inner.state {
            CircuitState::Closed => {
                self.inner.failure_count = self.inner.failure_count.saturating_add(1);
                if self.inner.failure_count >= self.config.failure_threshold {
                    self.open(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.inner.failure_count = self.inner.failure_count.saturating_add(1);
                self.open(now);
                true
            }
            // Late outcome of an attempt admitted before the breaker opened
            CircuitState::Open => false,
        }
    }

    /// Force the breaker closed and clear its history
    pub fn reset(&mut self) {
        self.close();
    }

    pub fn state(&self) -> CircuitState {
        self.inner.state
    }

    /// Full breaker state
    pub fn inner(&self) -> &CircuitBreakerState {
        &self.inner
    }

    pub fn snapshot(&self, now: Instant) -> CircuitBreakerSnapshot {
        let open_for_ms = match (self.inner.state, self.inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(now.saturating_duration_since(opened_at).as_millis() as u64)
            }
            _ => None,
        };

        CircuitBreakerSnapshot {
            state: self.inner.state,
            failure_count: self.inner.failure_count,
            half_open_attempts: self.inner.half_open_attempts,
            open_for_ms,
        }
    }

    fn open(&mut self, now: Instant) {
        self.inner.state = CircuitState::Open;
        self.inner.opened_at = Some(now);
        self.inner.half_open_attempts = 0;
    }

    fn close(&mut self) {
        self.inner = CircuitBreakerState::default();
    }
}
