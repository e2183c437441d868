//! Result sinks for sync attempts
//!
//! The scheduler hands every [`SyncResult`] to exactly one configured
//! sink, once per attempt, in completion order. Sinks run inline on the
//! scheduler task and must not block.

use crate::sync::scheduler::SyncResult;
use std::sync::Arc;
use tracing::{info, warn};

/// Receiver for per-attempt sync results
pub trait ResultSink: Send + Sync {
    /// Called once for every attempt, successful or not
    fn on_result(&self, result: &SyncResult);
}

impl<F> ResultSink for F
where
    F: Fn(&SyncResult) + Send + Sync,
{
    fn on_result(&self, result: &SyncResult) {
        self(result)
    }
}

/// Logs each result as a structured tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn on_result(&self, result: &SyncResult) {
        match &result.error {
            None => info!(
                source = %result.source,
                items = result.items_processed.unwrap_or(0),
                duration_ms = result.duration.as_millis() as u64,
                retry_count = result.retry_count,
                "Sync completed"
            ),
            Some(failure) => warn!(
                source = %result.source,
                reason = failure.reason(),
                error = %failure,
                duration_ms = result.duration.as_millis() as u64,
                retry_count = result.retry_count,
                "Sync failed"
            ),
        }
    }
}

/// Delivers each result to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }

    /// Append another sink
    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for FanoutSink {
    fn on_result(&self, result: &SyncResult) {
        for sink in &self.sinks {
            sink.on_result(result);
        }
    }
}
