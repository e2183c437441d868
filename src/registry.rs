//! Process-wide scheduler accessor
//!
//! Hosts normally build a [`SyncScheduler`] at their composition root and
//! [`install_scheduler`] it. [`get_scheduler`] falls back to a scheduler
//! built from the environment with the HTTP handler and tracing sink.

use crate::config::Config;
use crate::error::SchedulerError;
use crate::sync::{HttpSourceHandler, SyncScheduler, TracingSink};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

static SCHEDULER: Lazy<Mutex<Option<SyncScheduler>>> = Lazy::new(|| Mutex::new(None));

/// Return the shared scheduler, building the default one on first use
pub fn get_scheduler() -> Result<SyncScheduler, SchedulerError> {
    let mut slot = SCHEDULER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(scheduler) = slot.as_ref() {
        return Ok(scheduler.clone());
    }

    let scheduler = default_scheduler()?;
    *slot = Some(scheduler.clone());
    Ok(scheduler)
}

/// Register a scheduler built by the host, replacing any previous one
///
/// The replaced scheduler's timers are stopped.
pub fn install_scheduler(scheduler: SyncScheduler) {
    let previous = SCHEDULER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(scheduler);
    if let Some(previous) = previous {
        previous.stop_all();
    }
}

/// Discard the shared scheduler after stopping all of its timers
///
/// The next [`get_scheduler`] call builds a fresh instance.
pub fn reset_scheduler() {
    let previous = SCHEDULER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(previous) = previous {
        previous.stop_all();
        info!("Shared scheduler reset");
    }
}

fn default_scheduler() -> Result<SyncScheduler, SchedulerError> {
    let config = Config::from_env().map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
    let handler = HttpSourceHandler::new(&config.http, &config.sources)
        .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

    SyncScheduler::from_config(&config, Arc::new(handler), Some(Arc::new(TracingSink)))
}
