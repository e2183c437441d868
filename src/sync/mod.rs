//! Resilient periodic synchronization
//!
//! This module schedules per-source sync jobs and protects each upstream
//! with a sliding-window rate limiter, a circuit breaker and jittered
//! exponential backoff.
//!
//! # Components
//!
//! - [`scheduler`]: Per-source scheduling, retries and introspection
//! - [`rate_limit`]: Sliding-window admission control
//! - [`circuit_breaker`]: Closed / open / half-open state machine
//! - [`backoff`]: Jittered exponential retry delays
//! - [`sink`]: Delivery of per-attempt results
//! - [`http_source`]: Handler that fetches sources over HTTP
//!
//! # Example
//!
//! ```ignore
//! use resilient_sync::sync::{HttpSourceHandler, SyncScheduler, TracingSink};
//!
//! let handler = HttpSourceHandler::new(&config.http, &config.sources)?;
//! let scheduler = SyncScheduler::from_config(
//!     &config,
//!     Arc::new(handler),
//!     Some(Arc::new(TracingSink)),
//! )?;
//!
//! scheduler.start_all();
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod http_source;
pub mod rate_limit;
pub mod scheduler;
pub mod sink;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitBreakerState, CircuitState};
pub use http_source::HttpSourceHandler;
pub use rate_limit::{RateLimitSnapshot, RateLimitState, SlidingWindowLimiter};
pub use scheduler::{
    SchedulerBuilder, SourceSnapshot, SyncHandler, SyncOutput, SyncResult, SyncScheduler,
};
pub use sink::{FanoutSink, ResultSink, TracingSink};
