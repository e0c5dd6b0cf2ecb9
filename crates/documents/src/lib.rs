//! Document lifecycle: states, the fixed transition table, lifecycle events
//! and the replay fold that derives a document's state from its history.
//!
//! Pure domain code, no IO.

pub mod event;
pub mod lifecycle;
pub mod replay;

pub use event::{ActorType, InvoiceEvent, InvoiceEventType};
pub use lifecycle::{DocumentState, allowed_transitions, check_transition, is_transition_allowed};
pub use replay::{DocumentLifecycle, TimelineEntry, TransitionViolation};
