//! Error types for resilient-sync
//!
//! Handler-side failures ([`SyncError`]) are what a source handler raises.
//! The scheduler never propagates them: every attempt is folded into a
//! [`SyncFailure`] carried by the emitted `SyncResult`. Control operations
//! that can be misused (unknown sources, bad configuration) return
//! [`SchedulerError`].

use serde::Serialize;
use thiserror::Error;

/// Errors raised by source handlers while fetching upstream data
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// No upstream endpoint configured for the source
    #[error("No endpoint configured for source: {0}")]
    MissingEndpoint(String),

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),
}

/// Why a sync attempt did not succeed
///
/// The `Display` form is the operator-facing error string.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncFailure {
    /// Admission denied by the source's sliding-window rate limiter
    #[error("RATE_LIMIT_EXCEEDED")]
    RateLimited,

    /// Admission denied because the source's circuit breaker is open
    #[error("CIRCUIT_BREAKER_OPEN")]
    CircuitOpen,

    /// Admission denied because the half-open trial budget is spent
    #[error("Circuit breaker half-open: max attempts exceeded")]
    HalfOpenCapExceeded,

    /// The handler ran and failed
    #[error("{0}")]
    Upstream(String),

    /// The source is not in the configured catalog
    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

impl SyncFailure {
    /// Returns true if the attempt was refused before the handler ran
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            SyncFailure::RateLimited | SyncFailure::CircuitOpen | SyncFailure::HalfOpenCapExceeded
        )
    }

    /// Short, stable label for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            SyncFailure::RateLimited => "rate_limited",
            SyncFailure::CircuitOpen => "circuit_open",
            SyncFailure::HalfOpenCapExceeded => "half_open_cap_exceeded",
            SyncFailure::Upstream(_) => "upstream",
            SyncFailure::UnknownSource(_) => "unknown_source",
        }
    }
}

impl From<SyncError> for SyncFailure {
    fn from(err: SyncError) -> Self {
        SyncFailure::Upstream(err.to_string())
    }
}

/// Errors from scheduler control operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// Source not present in the catalog
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Invalid source or scheduler configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
