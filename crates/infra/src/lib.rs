//! Infrastructure layer: job queue, circuit breaker, document event log,
//! the submission worker and their Postgres/in-memory backends.

/// Per-service circuit breaker.
pub mod circuit;
/// Configuration loading and representation.
pub mod config;
/// Event-sourced document lifecycle log.
pub mod event_log;
/// Durable job queue with retries and dead letters.
pub mod jobs;
pub mod notifications;
pub mod pagination;
/// Postgres schema wiring.
pub mod schema;
pub mod services;
/// Submission worker (composition root).
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, QueueConfig, TaxbridgeConfig, WorkerConfig};
pub use services::Services;
