//! Notification fan-out for collaborators of the submission core.
//!
//! Persisted state (jobs, circuit rows, lifecycle events) is the source of
//! truth. The bus only distributes "something changed" messages after the
//! write has committed.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription, publish_best_effort};
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryEventBus};
