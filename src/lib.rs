//! resilient-sync - Resilient periodic synchronization of upstream sources
//!
//! This crate schedules recurring sync jobs for a catalog of named sources
//! and shields each upstream with a sliding-window rate limiter, a circuit
//! breaker and jittered exponential backoff. Every attempt is reported to a
//! pluggable result sink.

pub mod config;
pub mod error;
pub mod otel;
pub mod registry;
pub mod sync;
