//! Resilient sync scheduler
//!
//! Runs per-source sync jobs on a recurring schedule. Every attempt goes
//! through the source's circuit breaker and sliding-window rate limiter
//! before the injected handler is called; failed attempts schedule a
//! single jittered backoff retry. Sources share no mutable state, so one
//! failing upstream never affects another.
//!
//! # Example
//!
//! ```ignore
//! use resilient_sync::sync::{SyncScheduler, TracingSink};
//!
//! let scheduler = SyncScheduler::builder(handler)
//!     .sources(config.sources.clone())
//!     .sink(Arc::new(TracingSink))
//!     .build()?;
//!
//! scheduler.start_all();
//! let result = scheduler.execute_sync("airdrops").await;
//! ```

use crate::config::{Config, SchedulerOptions, SourceConfig};
use crate::error::{SchedulerError, SyncError, SyncFailure};
use crate::sync::backoff::Backoff;
use crate::sync::circuit_breaker::{
    CircuitBreaker, CircuitBreakerSnapshot, CircuitBreakerState, CircuitState,
};
use crate::sync::rate_limit::{RateLimitSnapshot, RateLimitState, SlidingWindowLimiter};
use crate::sync::sink::ResultSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Payload returned by a successful handler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutput {
    /// Number of items fetched and processed
    pub items_processed: u64,
}

/// Fetches one source's upstream data
///
/// Supplied by the host application. Any error counts as a failed
/// attempt; its `Display` text becomes the result's error message.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Perform synchronization for `source`
    async fn sync(&self, source: &str) -> Result<SyncOutput, SyncError>;
}

/// Outcome of a single sync attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub source: String,
    pub success: bool,
    pub items_processed: Option<u64>,
    pub error: Option<SyncFailure>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    /// Consecutive failures before this attempt; this was attempt `retry_count + 1`
    pub retry_count: u32,
}

impl SyncResult {
    pub fn succeeded(source: &str, items_processed: u64, duration: Duration, retry_count: u32) -> Self {
        Self {
            source: source.to_string(),
            success: true,
            items_processed: Some(items_processed),
            error: None,
            duration,
            timestamp: Utc::now(),
            retry_count,
        }
    }

    pub fn failed(source: &str, failure: SyncFailure, duration: Duration, retry_count: u32) -> Self {
        Self {
            source: source.to_string(),
            success: false,
            items_processed: None,
            error: Some(failure),
            duration,
            timestamp: Utc::now(),
            retry_count,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Operator view of one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limit: RateLimitSnapshot,
    pub retry_count: u32,
    /// Whether a recurring timer is armed
    pub active: bool,
    /// Whether a backoff retry is waiting to fire
    pub retry_pending: bool,
}

struct PendingRetry {
    id: u64,
    // Dropping the sender cancels the retry task
    _cancel: watch::Sender<()>,
}

struct SourceGuard {
    rate_limiter: SlidingWindowLimiter,
    breaker: CircuitBreaker,
    retry_count: u32,
    recurring: Option<watch::Sender<()>>,
    retry: Option<PendingRetry>,
    // Bumped by `stop`; attempts that straddle a stop do not schedule retries
    epoch: u64,
}

struct SourceState {
    config: SourceConfig,
    backoff: Backoff,
    guard: Mutex<SourceGuard>,
}

impl SourceState {
    fn new(config: SourceConfig, now: Instant) -> Self {
        Self {
            backoff: Backoff::new(config.backoff),
            guard: Mutex::new(SourceGuard {
                rate_limiter: SlidingWindowLimiter::new(config.rate_limit, now),
                breaker: CircuitBreaker::new(config.circuit_breaker),
                retry_count: 0,
                recurring: None,
                retry: None,
                epoch: 0,
            }),
            config,
        }
    }

    // Critical sections never panic, so a poisoned lock still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, SourceGuard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SchedulerInner {
    sources: BTreeMap<String, SourceState>,
    handler: Arc<dyn SyncHandler>,
    sink: Option<Arc<dyn ResultSink>>,
    options: SchedulerOptions,
    next_timer_id: AtomicU64,
}

/// Builder for [`SyncScheduler`]
pub struct SchedulerBuilder {
    sources: BTreeMap<String, SourceConfig>,
    handler: Arc<dyn SyncHandler>,
    sink: Option<Arc<dyn ResultSink>>,
    options: SchedulerOptions,
}

impl SchedulerBuilder {
    /// Replace the source catalog
    pub fn sources(mut self, sources: BTreeMap<String, SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    /// Add or replace one source
    pub fn source(mut self, name: impl Into<String>, config: SourceConfig) -> Self {
        self.sources.insert(name.into(), config);
        self
    }

    /// Set the result sink
    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set scheduler-wide options
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the catalog and build the scheduler with fresh per-source state
    pub fn build(self) -> Result<SyncScheduler, SchedulerError> {
        for (name, config) in &self.sources {
            config
                .validate(name)
                .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        }

        let now = Instant::now();
        let sources = self
            .sources
            .into_iter()
            .map(|(name, config)| (name, SourceState::new(config, now)))
            .collect();

        Ok(SyncScheduler {
            inner: Arc::new(SchedulerInner {
                sources,
                handler: self.handler,
                sink: self.sink,
                options: self.options,
                next_timer_id: AtomicU64::new(0),
            }),
        })
    }
}

/// Periodic sync scheduler with per-source isolation
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("sources", &self.inner.sources.keys().collect::<Vec<_>>())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SyncScheduler {
    /// Start building a scheduler around `handler`, with an empty catalog
    pub fn builder(handler: Arc<dyn SyncHandler>) -> SchedulerBuilder {
        SchedulerBuilder {
            sources: BTreeMap::new(),
            handler,
            sink: None,
            options: SchedulerOptions::default(),
        }
    }

    /// Build a scheduler from application configuration
    pub fn from_config(
        config: &Config,
        handler: Arc<dyn SyncHandler>,
        sink: Option<Arc<dyn ResultSink>>,
    ) -> Result<Self, SchedulerError> {
        let mut builder = Self::builder(handler)
            .sources(config.sources.clone())
            .options(config.scheduler.clone());
        if let Some(sink) = sink {
            builder = builder.sink(sink);
        }
        builder.build()
    }

    /// Whether `self` and `other` share the same underlying state
    pub fn same_instance(&self, other: &SyncScheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Names of all configured sources
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.inner.sources.keys().map(String::as_str)
    }

    /// Run one sync attempt for `source`
    ///
    /// Never fails: every outcome, including admission rejections and
    /// unknown sources, is reported as a [`SyncResult`] and delivered to
    /// the sink.
    pub async fn execute_sync(&self, source: &str) -> SyncResult {
        let Some(state) = self.inner.sources.get(source) else {
            warn!(source = source, "Sync requested for unknown source");
            let result = SyncResult::failed(
                source,
                SyncFailure::UnknownSource(source.to_string()),
                Duration::ZERO,
                0,
            );
            self.emit(&result);
            return result;
        };

        let started = Instant::now();

        let admission = {
            let mut guard = state.lock();
            self.admit(source, &mut guard, started)
        };
        let (retry_count, epoch) = match admission {
            Ok(admitted) => admitted,
            Err((failure, retry_count)) => {
                debug!(source = source, reason = failure.reason(), "Sync attempt rejected");
                let result = SyncResult::failed(source, failure, started.elapsed(), retry_count);
                self.emit(&result);
                return result;
            }
        };

        let outcome = self.invoke_handler(source).await;
        let duration = started.elapsed();

        let result = {
            let mut guard = state.lock();
            match outcome {
                Ok(output) => {
                    guard.retry_count = 0;
                    // Recovered; a backoff retry from an earlier failure is moot
                    guard.retry = None;
                    if guard.breaker.record_success() == CircuitState::HalfOpen {
                        info!(source = source, "Circuit breaker closed");
                    }
                    SyncResult::succeeded(source, output.items_processed, duration, retry_count)
                }
                Err(failure) => {
                    let opened = guard.breaker.record_failure(Instant::now());
                    let attempt = guard.retry_count;
                    guard.retry_count = guard.retry_count.saturating_add(1);

                    if opened {
                        warn!(
                            source = source,
                            failures = guard.breaker.inner().failure_count,
                            reset_timeout_ms = state.config.circuit_breaker.reset_timeout_ms,
                            "Circuit breaker opened"
                        );
                        guard.retry = None;
                    } else if guard.breaker.state() != CircuitState::Open && guard.epoch == epoch {
                        let delay = state.backoff.delay(attempt);
                        self.schedule_retry(source, &mut guard, delay);
                    }

                    SyncResult::failed(source, failure, duration, retry_count)
                }
            }
        };

        self.emit(&result);
        result
    }

    /// Run `source` now, then every `interval_ms`
    ///
    /// Re-arming a running source replaces its previous timer.
    pub fn start(&self, source: &str) -> Result<(), SchedulerError> {
        let state = self.source_state(source)?;
        let interval = state.config.interval();
        let (cancel_tx, mut cancel_rx) = watch::channel(());

        let replaced = state.lock().recurring.replace(cancel_tx).is_some();
        info!(
            source = source,
            interval_ms = state.config.interval_ms,
            replaced = replaced,
            "Recurring sync armed"
        );

        let scheduler = self.clone();
        let name = source.to_string();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Sender dropped: the timer was stopped or replaced
                if cancel_rx.has_changed().is_err() {
                    break;
                }
                scheduler.execute_sync(&name).await;

                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
            }
            debug!(source = %name, "Recurring sync task exited");
        });

        Ok(())
    }

    /// Disarm `source`'s recurring timer and cancel any pending retry
    ///
    /// Idempotent. An attempt already running is allowed to finish but
    /// will not schedule a retry.
    pub fn stop(&self, source: &str) -> Result<(), SchedulerError> {
        let state = self.source_state(source)?;
        let mut guard = state.lock();

        let had_timer = guard.recurring.take().is_some();
        let had_retry = guard.retry.take().is_some();
        guard.epoch = guard.epoch.wrapping_add(1);

        if had_timer || had_retry {
            info!(
                source = source,
                timer = had_timer,
                retry = had_retry,
                "Sync stopped"
            );
        }
        Ok(())
    }

    /// Start every configured source
    pub fn start_all(&self) {
        for source in self.inner.sources.keys() {
            // Catalog keys always resolve
            let _ = self.start(source);
        }
    }

    /// Stop every configured source
    pub fn stop_all(&self) {
        for source in self.inner.sources.keys() {
            let _ = self.stop(source);
        }
    }

    /// Force `source`'s breaker closed and clear its retry counter
    pub fn reset_circuit_breaker(&self, source: &str) -> Result<(), SchedulerError> {
        let state = self.source_state(source)?;
        let mut guard = state.lock();
        let previous = guard.breaker.state();
        guard.breaker.reset();
        guard.retry_count = 0;

        if previous != CircuitState::Closed {
            info!(source = source, previous = %previous, "Circuit breaker manually reset");
        }
        Ok(())
    }

    pub fn get_circuit_breaker_state(&self, source: &str) -> Option<CircuitBreakerState> {
        self.inner
            .sources
            .get(source)
            .map(|state| state.lock().breaker.inner().clone())
    }

    pub fn get_rate_limit_state(&self, source: &str) -> Option<RateLimitState> {
        self.inner
            .sources
            .get(source)
            .map(|state| state.lock().rate_limiter.state().clone())
    }

    pub fn get_retry_count(&self, source: &str) -> Option<u32> {
        self.inner
            .sources
            .get(source)
            .map(|state| state.lock().retry_count)
    }

    /// Whether `source` has a recurring timer armed
    pub fn is_active(&self, source: &str) -> bool {
        self.inner
            .sources
            .get(source)
            .map(|state| state.lock().recurring.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of every source, keyed by name
    pub fn get_all_states(&self) -> BTreeMap<String, SourceSnapshot> {
        let now = Instant::now();
        self.inner
            .sources
            .iter()
            .map(|(name, state)| {
                let guard = state.lock();
                let snapshot = SourceSnapshot {
                    circuit_breaker: guard.breaker.snapshot(now),
                    rate_limit: guard.rate_limiter.snapshot(now),
                    retry_count: guard.retry_count,
                    active: guard.recurring.is_some(),
                    retry_pending: guard.retry.is_some(),
                };
                (name.clone(), snapshot)
            })
            .collect()
    }

    /// Jittered backoff delay `source` would wait before retry `attempt`
    pub fn backoff_delay(&self, source: &str, attempt: u32) -> Option<Duration> {
        self.inner
            .sources
            .get(source)
            .map(|state| state.backoff.delay(attempt))
    }

    fn source_state(&self, source: &str) -> Result<&SourceState, SchedulerError> {
        self.inner
            .sources
            .get(source)
            .ok_or_else(|| SchedulerError::UnknownSource(source.to_string()))
    }

    /// Breaker then rate limiter, in one critical section
    ///
    /// Returns the pre-attempt retry count and stop epoch when admitted, or
    /// the rejection and the unchanged retry count.
    fn admit(
        &self,
        source: &str,
        guard: &mut SourceGuard,
        now: Instant,
    ) -> Result<(u32, u64), (SyncFailure, u32)> {
        let before = guard.breaker.state();
        let checked = guard.breaker.check(now);
        if before == CircuitState::Open && guard.breaker.state() == CircuitState::HalfOpen {
            info!(source = source, "Circuit breaker half-open, probing upstream");
        }
        checked.map_err(|failure| (failure, guard.retry_count))?;

        if !guard.rate_limiter.allow(now) {
            return Err((SyncFailure::RateLimited, guard.retry_count));
        }

        guard.breaker.record_attempt();
        Ok((guard.retry_count, guard.epoch))
    }

    async fn invoke_handler(&self, source: &str) -> Result<SyncOutput, SyncFailure> {
        let handler = Arc::clone(&self.inner.handler);
        let name = source.to_string();
        let mut task = tokio::spawn(async move { handler.sync(&name).await });

        let joined = match self.inner.options.handler_timeout() {
            Some(deadline) => match tokio::time::timeout(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!(
                        source = source,
                        timeout_ms = deadline.as_millis() as u64,
                        "Sync timed out"
                    );
                    return Err(SyncFailure::Upstream("Sync timed out".to_string()));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(err.into()),
            Err(err) if err.is_panic() => {
                warn!(source = source, "Sync handler panicked");
                Err(SyncFailure::Upstream("Sync handler panicked".to_string()))
            }
            Err(err) => Err(SyncFailure::Upstream(format!("Sync handler aborted: {}", err))),
        }
    }

    /// Arm the single retry slot for `source`, replacing any pending retry
    fn schedule_retry(&self, source: &str, guard: &mut SourceGuard, delay: Duration) {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = watch::channel(());
        guard.retry = Some(PendingRetry {
            id,
            _cancel: cancel_tx,
        });

        debug!(
            source = source,
            retry_count = guard.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let scheduler = self.clone();
        let name = source.to_string();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if scheduler.take_retry(&name, id) {
                scheduler.execute_sync(&name).await;
            }
        });
    }

    /// Clear the retry slot if it still holds retry `id`
    fn take_retry(&self, source: &str, id: u64) -> bool {
        let Some(state) = self.inner.sources.get(source) else {
            return false;
        };
        let mut guard = state.lock();
        match &guard.retry {
            Some(pending) if pending.id == id => {
                guard.retry = None;
                true
            }
            _ => false,
        }
    }

    fn emit(&self, result: &SyncResult) {
        if let Some(sink) = &self.inner.sink {
            sink.on_result(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use std::sync::atomic::AtomicU32;

    /// Handler driven by a closure over (source, call index)
    struct FnHandler<F> {
        respond: F,
        calls: AtomicU32,
    }

    impl<F> FnHandler<F>
    where
        F: Fn(&str, u32) -> Result<SyncOutput, SyncError> + Send + Sync,
    {
        fn new(respond: F) -> Arc<Self> {
            Arc::new(Self {
                respond,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> SyncHandler for FnHandler<F>
    where
        F: Fn(&str, u32) -> Result<SyncOutput, SyncError> + Send + Sync,
    {
        async fn sync(&self, source: &str) -> Result<SyncOutput, SyncError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(source, call)
        }
    }

    /// Handler that succeeds after sleeping
    struct SlowHandler {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SyncHandler for SlowHandler {
        async fn sync(&self, _source: &str) -> Result<SyncOutput, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(SyncOutput { items_processed: 1 })
        }
    }

    fn ok(items: u64) -> Result<SyncOutput, SyncError> {
        Ok(SyncOutput {
            items_processed: items,
        })
    }

    fn source_config() -> SourceConfig {
        SourceConfig {
            interval_ms: 1_000,
            backoff: BackoffConfig {
                base_delay_ms: 1_000,
                max_delay_ms: 1_000,
            },
            ..SourceConfig::default()
        }
    }

    fn scheduler(handler: Arc<dyn SyncHandler>, config: SourceConfig) -> SyncScheduler {
        SyncScheduler::builder(handler)
            .source("airdrops", config)
            .build()
            .unwrap()
    }

    // Test 1: Rate limiter rejects the request past max_requests
    #[tokio::test]
    async fn test_rate_limit_exceeded() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| ok(1));
        let mut config = source_config();
        config.rate_limit.max_requests = 3;
        config.rate_limit.window_ms = 60_000;
        let scheduler = scheduler(handler.clone(), config);

        for _ in 0..3 {
            assert!(scheduler.execute_sync("airdrops").await.success);
        }

        let result = scheduler.execute_sync("airdrops").await;
        assert!(!result.success);
        assert_eq!(result.error, Some(SyncFailure::RateLimited));
        assert!(result
            .error
            .unwrap()
            .to_string()
            .contains("RATE_LIMIT_EXCEEDED"));
        assert_eq!(handler.calls(), 3);
        assert_eq!(
            scheduler.get_rate_limit_state("airdrops").unwrap().requests.len(),
            3
        );
    }

    // Test 1b: Requests are admitted again once the window has passed
    #[tokio::test]
    async fn test_rate_limit_window_recovers() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| ok(1));
        let mut config = source_config();
        config.rate_limit.max_requests = 2;
        config.rate_limit.window_ms = 10_000;
        let scheduler = scheduler(handler.clone(), config);

        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("airdrops").await;
        assert_eq!(
            scheduler.execute_sync("airdrops").await.error,
            Some(SyncFailure::RateLimited)
        );

        tokio::time::advance(Duration::from_millis(10_001)).await;
        assert!(scheduler.execute_sync("airdrops").await.success);
        assert_eq!(handler.calls(), 3);
    }

    // Test 2: Breaker opens at the failure threshold and short-circuits
    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| Err(SyncError::ServerError(503)));
        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 5;
        let scheduler = scheduler(handler.clone(), config);

        for _ in 0..5 {
            let result = scheduler.execute_sync("airdrops").await;
            assert_eq!(
                result.error,
                Some(SyncFailure::Upstream("Server error: HTTP 503".to_string()))
            );
        }

        let breaker = scheduler.get_circuit_breaker_state("airdrops").unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, 5);

        let result = scheduler.execute_sync("airdrops").await;
        assert!(!result.success);
        assert!(result
            .error
            .as_ref()
            .unwrap()
            .to_string()
            .contains("CIRCUIT_BREAKER_OPEN"));
        assert_eq!(result.duration, Duration::ZERO);
        assert_eq!(handler.calls(), 5);

        // Rejections leave the retry counter and limiter alone
        assert_eq!(result.retry_count, 5);
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(5));
        assert_eq!(
            scheduler.get_rate_limit_state("airdrops").unwrap().requests.len(),
            5
        );
    }

    // Test 3: Success after a failure resets the retry counter
    #[tokio::test]
    async fn test_retry_count_resets_on_success() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, call| {
            if call == 0 {
                Err(SyncError::NetworkTimeout)
            } else {
                ok(10)
            }
        });
        let scheduler = scheduler(handler.clone(), source_config());

        let first = scheduler.execute_sync("airdrops").await;
        assert!(!first.success);
        assert_eq!(first.retry_count, 0);
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(1));

        let second = scheduler.execute_sync("airdrops").await;
        assert!(second.success);
        assert_eq!(second.items_processed, Some(10));
        assert_eq!(second.retry_count, 1);
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(0));

        // The retry armed by the first failure is cancelled by the recovery
        assert!(!scheduler.get_all_states()["airdrops"].retry_pending);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.calls(), 2);
    }

    // Test 4: A failing source does not affect another
    #[tokio::test]
    async fn test_sources_are_isolated() {
        tokio::time::pause();
        let handler = FnHandler::new(|source, _| {
            if source == "airdrops" {
                Err(SyncError::ConnectionRefused)
            } else {
                ok(4)
            }
        });
        let mut failing = source_config();
        failing.circuit_breaker.failure_threshold = 1;
        let scheduler = SyncScheduler::builder(handler)
            .source("airdrops", failing)
            .source("quests", source_config())
            .build()
            .unwrap();

        let (airdrops, quests) = tokio::join!(
            scheduler.execute_sync("airdrops"),
            scheduler.execute_sync("quests")
        );

        assert!(!airdrops.success);
        assert!(quests.success);
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap().state,
            CircuitState::Open
        );
        assert_eq!(
            scheduler.get_circuit_breaker_state("quests").unwrap().state,
            CircuitState::Closed
        );

        // The healthy source's limiter and retry counter only saw its own call
        assert_eq!(
            scheduler.get_rate_limit_state("quests").unwrap().requests.len(),
            1
        );
        let quests = &scheduler.get_all_states()["quests"];
        assert_eq!(quests.rate_limit.requests_in_window, 1);
        assert_eq!(quests.rate_limit.remaining, 9);
        assert_eq!(quests.retry_count, 0);
        assert!(!quests.retry_pending);
    }

    // Test 5: Failed attempts schedule a backoff retry
    #[tokio::test]
    async fn test_failure_schedules_retry() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, call| {
            if call == 0 {
                Err(SyncError::NetworkTimeout)
            } else {
                ok(2)
            }
        });
        let scheduler = scheduler(handler.clone(), source_config());

        scheduler.execute_sync("airdrops").await;
        assert!(scheduler.get_all_states()["airdrops"].retry_pending);

        // Base delay is 1000ms with at most 10% jitter
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(handler.calls(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.calls(), 2);
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(0));
        assert!(!scheduler.get_all_states()["airdrops"].retry_pending);
    }

    // Test 6: Only one retry is pending per source
    #[tokio::test]
    async fn test_retry_slot_replaces_pending_retry() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| Err(SyncError::NetworkTimeout));
        let mut config = source_config();
        config.backoff.max_delay_ms = 60_000;
        config.circuit_breaker.failure_threshold = 100;
        config.rate_limit.max_requests = 100;
        let scheduler = scheduler(handler.clone(), config);

        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("airdrops").await;
        assert_eq!(handler.calls(), 2);

        // The first retry (about 1s) was replaced by the second (about 2s)
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(handler.calls(), 2);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(handler.calls(), 3);
    }

    // Test 7: Opening the breaker cancels the pending retry
    #[tokio::test]
    async fn test_open_breaker_cancels_retry() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| Err(SyncError::NetworkTimeout));
        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 2;
        let scheduler = scheduler(handler.clone(), config);

        scheduler.execute_sync("airdrops").await;
        assert!(scheduler.get_all_states()["airdrops"].retry_pending);

        scheduler.execute_sync("airdrops").await;
        assert!(!scheduler.get_all_states()["airdrops"].retry_pending);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.calls(), 2);
    }

    // Test 8: Open breaker recovers through half-open after the reset timeout
    #[tokio::test]
    async fn test_half_open_recovery() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, call| {
            if call == 0 {
                Err(SyncError::ServerError(500))
            } else {
                ok(7)
            }
        });
        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.reset_timeout_ms = 1_000;
        let scheduler = scheduler(handler.clone(), config);

        scheduler.execute_sync("airdrops").await;
        assert_eq!(
            scheduler.execute_sync("airdrops").await.error,
            Some(SyncFailure::CircuitOpen)
        );

        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let result = scheduler.execute_sync("airdrops").await;
        assert!(result.success);
        let breaker = scheduler.get_circuit_breaker_state("airdrops").unwrap();
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(handler.calls(), 2);
    }

    // Test 9: Concurrent trials past the half-open cap are rejected
    #[tokio::test]
    async fn test_half_open_cap() {
        tokio::time::pause();
        let handler = Arc::new(SlowHandler {
            delay: Duration::from_millis(500),
            calls: AtomicU32::new(0),
        });
        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.reset_timeout_ms = 100;
        config.circuit_breaker.half_open_max_attempts = 1;
        let scheduler = scheduler(handler.clone(), config);

        {
            let state = scheduler.inner.sources.get("airdrops").unwrap();
            let mut guard = state.lock();
            guard.breaker.record_failure(Instant::now());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let trial = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.execute_sync("airdrops").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rejected = scheduler.execute_sync("airdrops").await;
        assert_eq!(rejected.error, Some(SyncFailure::HalfOpenCapExceeded));
        assert_eq!(
            rejected.error.unwrap().to_string(),
            "Circuit breaker half-open: max attempts exceeded"
        );

        assert!(trial.await.unwrap().success);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap().state,
            CircuitState::Closed
        );
    }

    // Test 10: Rate-limited requests do not consume half-open trials
    #[tokio::test]
    async fn test_rate_limit_does_not_burn_trial() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| ok(1));
        let mut config = source_config();
        config.rate_limit.max_requests = 1;
        config.rate_limit.window_ms = 60_000;
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.reset_timeout_ms = 100;
        let scheduler = scheduler(handler.clone(), config);

        assert!(scheduler.execute_sync("airdrops").await.success);
        {
            let state = scheduler.inner.sources.get("airdrops").unwrap();
            state.lock().breaker.record_failure(Instant::now());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = scheduler.execute_sync("airdrops").await;
        assert_eq!(result.error, Some(SyncFailure::RateLimited));
        let breaker = scheduler.get_circuit_breaker_state("airdrops").unwrap();
        assert_eq!(breaker.state, CircuitState::HalfOpen);
        assert_eq!(breaker.half_open_attempts, 0);
    }

    // Test 10b: A slow success finishing after the breaker opened keeps it open
    #[tokio::test]
    async fn test_late_success_keeps_breaker_open() {
        tokio::time::pause();
        struct SlowFirstCall {
            calls: AtomicU32,
        }

        #[async_trait]
        impl SyncHandler for SlowFirstCall {
            async fn sync(&self, _source: &str) -> Result<SyncOutput, SyncError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(SyncOutput { items_processed: 1 })
                } else {
                    Err(SyncError::ServerError(502))
                }
            }
        }

        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.reset_timeout_ms = 60_000;
        let scheduler = scheduler(
            Arc::new(SlowFirstCall {
                calls: AtomicU32::new(0),
            }),
            config,
        );

        let slow = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.execute_sync("airdrops").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("airdrops").await;
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap().state,
            CircuitState::Open
        );

        assert!(slow.await.unwrap().success);
        let breaker = scheduler.get_circuit_breaker_state("airdrops").unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, 2);
        assert_eq!(
            scheduler.execute_sync("airdrops").await.error,
            Some(SyncFailure::CircuitOpen)
        );
    }

    // Test 11: start runs immediately and then on every interval
    #[tokio::test]
    async fn test_start_and_stop_recurring() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| ok(1));
        let scheduler = scheduler(handler.clone(), source_config());

        scheduler.start("airdrops").unwrap();
        assert!(scheduler.is_active("airdrops"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.calls(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(handler.calls(), 2);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(handler.calls(), 3);

        scheduler.stop("airdrops").unwrap();
        assert!(!scheduler.is_active("airdrops"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.calls(), 3);
    }

    // Test 12: Restarting a source replaces its timer
    #[tokio::test]
    async fn test_start_replaces_timer() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| ok(1));
        let scheduler = scheduler(handler.clone(), source_config());

        scheduler.start("airdrops").unwrap();
        scheduler.start("airdrops").unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.calls(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(handler.calls(), 2);

        scheduler.stop_all();
    }

    // Test 13: stop cancels a scheduled retry and is idempotent
    #[tokio::test]
    async fn test_stop_cancels_retry() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| Err(SyncError::NetworkTimeout));
        let scheduler = scheduler(handler.clone(), source_config());

        scheduler.execute_sync("airdrops").await;
        assert!(scheduler.get_all_states()["airdrops"].retry_pending);

        scheduler.stop("airdrops").unwrap();
        scheduler.stop("airdrops").unwrap();
        assert!(!scheduler.get_all_states()["airdrops"].retry_pending);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.calls(), 1);
    }

    // Test 14: An attempt in flight during stop does not schedule a retry
    #[tokio::test]
    async fn test_in_flight_attempt_after_stop() {
        tokio::time::pause();
        struct FailSlowly;

        #[async_trait]
        impl SyncHandler for FailSlowly {
            async fn sync(&self, _source: &str) -> Result<SyncOutput, SyncError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(SyncError::NetworkTimeout)
            }
        }

        let scheduler = scheduler(Arc::new(FailSlowly), source_config());
        let attempt = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.execute_sync("airdrops").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop("airdrops").unwrap();

        assert!(!attempt.await.unwrap().success);
        assert!(!scheduler.get_all_states()["airdrops"].retry_pending);
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(1));
    }

    // Test 15: Unknown sources are reported, not panicked on
    #[tokio::test]
    async fn test_unknown_source() {
        let handler = FnHandler::new(|_, _| ok(1));
        let scheduler = scheduler(handler.clone(), source_config());

        let result = scheduler.execute_sync("nope").await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(SyncFailure::UnknownSource("nope".to_string()))
        );
        assert_eq!(handler.calls(), 0);

        assert_eq!(
            scheduler.start("nope"),
            Err(SchedulerError::UnknownSource("nope".to_string()))
        );
        assert!(scheduler.stop("nope").is_err());
        assert!(scheduler.reset_circuit_breaker("nope").is_err());
        assert!(scheduler.get_circuit_breaker_state("nope").is_none());
        assert!(scheduler.get_retry_count("nope").is_none());
        assert!(scheduler.backoff_delay("nope", 0).is_none());
        assert!(!scheduler.is_active("nope"));
    }

    // Test 16: Manual reset clears the breaker and retry counter
    #[tokio::test]
    async fn test_reset_circuit_breaker() {
        tokio::time::pause();
        let handler = FnHandler::new(|_, _| Err(SyncError::Unauthorized));
        let mut config = source_config();
        config.circuit_breaker.failure_threshold = 2;
        let scheduler = scheduler(handler.clone(), config);

        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("airdrops").await;
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap().state,
            CircuitState::Open
        );

        scheduler.reset_circuit_breaker("airdrops").unwrap();
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap(),
            CircuitBreakerState::default()
        );
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(0));

        // Resetting a closed breaker changes nothing
        scheduler.reset_circuit_breaker("airdrops").unwrap();
        assert_eq!(
            scheduler.get_circuit_breaker_state("airdrops").unwrap(),
            CircuitBreakerState::default()
        );

        scheduler.execute_sync("airdrops").await;
        assert_eq!(handler.calls(), 3);
    }

    // Test 17: Handler panics and timeouts become failures
    #[tokio::test]
    async fn test_handler_panic_and_timeout() {
        tokio::time::pause();
        let panicking = FnHandler::new(|_, _| panic!("boom"));
        let scheduler = scheduler(panicking, source_config());

        let result = scheduler.execute_sync("airdrops").await;
        assert_eq!(
            result.error,
            Some(SyncFailure::Upstream("Sync handler panicked".to_string()))
        );
        assert_eq!(scheduler.get_retry_count("airdrops"), Some(1));

        let slow = Arc::new(SlowHandler {
            delay: Duration::from_secs(10),
            calls: AtomicU32::new(0),
        });
        let scheduler = SyncScheduler::builder(slow)
            .source("airdrops", source_config())
            .options(SchedulerOptions {
                handler_timeout_ms: Some(100),
            })
            .build()
            .unwrap();

        let result = scheduler.execute_sync("airdrops").await;
        assert_eq!(
            result.error,
            Some(SyncFailure::Upstream("Sync timed out".to_string()))
        );
        assert!(result.duration >= Duration::from_millis(100));
    }

    // Test 18: The sink sees every attempt in completion order
    #[tokio::test]
    async fn test_sink_receives_every_result() {
        tokio::time::pause();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: Arc<dyn ResultSink> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |r: &SyncResult| {
                seen.lock()
                    .unwrap()
                    .push((r.success, r.error.as_ref().map(SyncFailure::reason)))
            })
        };

        let mut config = source_config();
        config.rate_limit.max_requests = 1;
        let scheduler = SyncScheduler::builder(FnHandler::new(|_, _| ok(1)))
            .source("airdrops", config)
            .sink(sink)
            .build()
            .unwrap();

        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("airdrops").await;
        scheduler.execute_sync("missing").await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (true, None),
                (false, Some("rate_limited")),
                (false, Some("unknown_source")),
            ]
        );
    }

    // Test 19: Introspection covers every source
    #[tokio::test]
    async fn test_get_all_states() {
        let scheduler = SyncScheduler::builder(FnHandler::new(|_, _| ok(1)))
            .sources(crate::config::default_sources())
            .build()
            .unwrap();

        let states = scheduler.get_all_states();
        assert_eq!(states.len(), 7);
        assert_eq!(scheduler.source_names().count(), 7);
        for snapshot in states.values() {
            assert_eq!(snapshot.circuit_breaker.state, CircuitState::Closed);
            assert_eq!(snapshot.rate_limit.requests_in_window, 0);
            assert_eq!(snapshot.retry_count, 0);
            assert!(!snapshot.active);
        }
    }

    // Test 20: Builder rejects invalid source configuration
    #[test]
    fn test_builder_validates_sources() {
        let mut config = source_config();
        config.rate_limit.max_requests = 0;

        let err = SyncScheduler::builder(FnHandler::new(|_, _| ok(1)))
            .source("airdrops", config)
            .build()
            .unwrap_err();

        match err {
            SchedulerError::InvalidConfig(msg) => {
                assert!(msg.contains("sources.airdrops.rate_limit.max_requests"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    // Test 21: Results serialize with a structured error
    #[test]
    fn test_sync_result_serialization() {
        let result = SyncResult::failed(
            "quests",
            SyncFailure::CircuitOpen,
            Duration::from_millis(42),
            3,
        );
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["source"], "quests");
        assert_eq!(json["success"], false);
        assert_eq!(json["duration_ms"], 42);
        assert_eq!(json["retry_count"], 3);
        assert_eq!(json["error"]["kind"], "circuit_open");
        assert!(json["items_processed"].is_null());
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let scheduler = scheduler(FnHandler::new(|_, _| ok(1)), source_config());
        let delay = scheduler.backoff_delay("airdrops", 5).unwrap();
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay <= Duration::from_millis(1_100));
    }
}
