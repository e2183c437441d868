//! Sliding-window rate limiter for source sync requests
//!
//! Each source owns one [`SlidingWindowLimiter`]. Admitted request
//! timestamps are kept oldest-first and pruned lazily on every check, so
//! the window always reflects the most recent `window_ms`.

use crate::config::RateLimitConfig;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Mutable window state for one source
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Admitted request timestamps within the window, oldest first
    pub requests: VecDeque<Instant>,

    /// When the window last drained completely
    pub last_reset: Instant,
}

/// Serializable view of a source's rate limit window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    /// Requests counted in the current window
    pub requests_in_window: usize,
    /// Requests still admissible in the current window
    pub remaining: u32,
    /// Configured admission cap
    pub max_requests: u32,
    /// Configured window length in milliseconds
    pub window_ms: u64,
    /// Milliseconds since the window last drained
    pub last_reset_ms_ago: u64,
}

/// Per-source sliding-window admission check
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    state: RateLimitState,
}

impl SlidingWindowLimiter {
    /// Create an empty window starting at `now`
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            state: RateLimitState {
                requests: VecDeque::new(),
                last_reset: now,
            },
        }
    }

    /// Admit or reject a request at `now`
    ///
    /// Rejection leaves the window untouched apart from pruning.
    pub fn allow(&mut self, now: Instant) -> bool {
        self.prune(now);

        if self.state.requests.len() >= self.config.max_requests as usize {
            return false;
        }

        self.state.requests.push_back(now);
        true
    }

    /// Drop timestamps that fell out of the window
    pub fn prune(&mut self, now: Instant) {
        let window = self.config.window();
        let before = self.state.requests.len();

        while let Some(oldest) = self.state.requests.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.state.requests.pop_front();
            } else {
                break;
            }
        }

        if before > 0 && self.state.requests.is_empty() {
            self.state.last_reset = now;
        }
    }

    /// Requests still admissible in the window at `now`, without mutating state
    pub fn remaining(&self, now: Instant) -> u32 {
        let used = self.in_window(now) as u32;
        self.config.max_requests.saturating_sub(used)
    }

    /// Current window state
    pub fn state(&self) -> &RateLimitState {
        &self.state
    }

    /// Serializable view of the window at `now`
    pub fn snapshot(&self, now: Instant) -> RateLimitSnapshot {
        RateLimitSnapshot {
            requests_in_window: self.in_window(now),
            remaining: self.remaining(now),
            max_requests: self.config.max_requests,
            window_ms: self.config.window_ms,
            last_reset_ms_ago: now
                .saturating_duration_since(self.state.last_reset)
                .as_millis() as u64,
        }
    }

    fn in_window(&self, now: Instant) -> usize {
        let window = self.config.window();
        self.state
            .requests
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }
}
