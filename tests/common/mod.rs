//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use resilient_sync::config::{BackoffConfig, CircuitBreakerConfig, RateLimitConfig, SourceConfig};
use resilient_sync::error::SyncError;
use resilient_sync::sync::{ResultSink, SyncHandler, SyncOutput, SyncResult};

/// Handler whose sources either always fail or succeed with a fixed count
pub struct MockHandler {
    failing: Mutex<HashSet<String>>,
    items: u64,
    calls: AtomicU32,
}

impl MockHandler {
    pub fn new(items: u64) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            items,
            calls: AtomicU32::new(0),
        })
    }

    /// Make `source` fail until [`MockHandler::recover`] is called
    pub fn fail(&self, source: &str) {
        self.failing.lock().unwrap().insert(source.to_string());
    }

    pub fn recover(&self, source: &str) {
        self.failing.lock().unwrap().remove(source);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncHandler for MockHandler {
    async fn sync(&self, source: &str) -> Result<SyncOutput, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(source) {
            return Err(SyncError::ServerError(503));
        }
        Ok(SyncOutput {
            items_processed: self.items,
        })
    }
}

/// Sink that records every result it receives
#[derive(Default)]
pub struct CollectingSink {
    results: Mutex<Vec<SyncResult>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<SyncResult> {
        self.results.lock().unwrap().clone()
    }
}

impl ResultSink for CollectingSink {
    fn on_result(&self, result: &SyncResult) {
        self.results.lock().unwrap().push(result.clone());
    }
}

/// Source config with small, test-friendly limits
pub fn test_source(max_requests: u32, failure_threshold: u32, reset_timeout_ms: u64) -> SourceConfig {
    SourceConfig {
        interval_ms: 60_000,
        rate_limit: RateLimitConfig {
            max_requests,
            window_ms: 60_000,
        },
        backoff: BackoffConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            ..CircuitBreakerConfig::default()
        },
        endpoint: None,
    }
}
