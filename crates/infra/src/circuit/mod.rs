//! Per-service circuit breaker.
//!
//! - `CircuitBreaker`: wraps calls with fail-fast / half-open / closed semantics
//! - `CircuitStore`: one persisted row per service (in-memory or PostgreSQL)
//! - `CircuitConfigRegistry`: injected per-service thresholds

pub mod breaker;
pub mod config;
pub mod postgres;
pub mod store;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitError};
pub use config::{CircuitConfig, CircuitConfigRegistry};
pub use postgres::PostgresCircuitStore;
pub use store::{CircuitStore, CircuitStoreError, InMemoryCircuitStore};
pub use types::{Admission, Applied, CircuitOp, CircuitSnapshot, CircuitState, Transition};
