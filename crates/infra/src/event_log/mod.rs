//! Event-sourced document lifecycle log.
//!
//! - [`EventLog`] enforces the fixed transition table on every write and
//!   derives current state from the latest event.
//! - [`EventLogStore`] is the append-only storage seam with in-memory and
//!   Postgres implementations.
//! - Audit export renders filtered events as JSON, JSON lines or CSV.

pub mod export;
pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod service;
pub mod store;

pub use export::{AuditFormat, CSV_HEADERS};
pub use in_memory::InMemoryEventLogStore;
pub use postgres::PostgresEventLogStore;
pub use query::{EventFilter, EventLogStats};
pub use service::{EMIT_ATTEMPTS, EventLog, NewInvoiceEvent};
pub use store::{EventLogError, EventLogStore, StreamHead};
