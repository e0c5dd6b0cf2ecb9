//! Document states and the authoritative transition table.
//!
//! ```text
//! DRAFT     -> VALIDATED | CANCELLED
//! VALIDATED -> QUEUED | SUBMITTED | CANCELLED
//! QUEUED    -> SUBMITTED | CANCELLED
//! SUBMITTED -> ACCEPTED | REJECTED | CANCELLED
//! ACCEPTED  -> CANCELLED
//! REJECTED  -> VALIDATED | CANCELLED
//! CANCELLED -> (terminal)
//! ```
//!
//! The table is compiled in. It is not configurable at runtime.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use taxbridge_core::{DomainError, DomainResult};

/// Lifecycle state of a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentState {
    Draft,
    Validated,
    Queued,
    Submitted,
    Accepted,
    Rejected,
    Cancelled,
}

impl DocumentState {
    pub const ALL: [DocumentState; 7] = [
        DocumentState::Draft,
        DocumentState::Validated,
        DocumentState::Queued,
        DocumentState::Submitted,
        DocumentState::Accepted,
        DocumentState::Rejected,
        DocumentState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Draft => "DRAFT",
            DocumentState::Validated => "VALIDATED",
            DocumentState::Queued => "QUEUED",
            DocumentState::Submitted => "SUBMITTED",
            DocumentState::Accepted => "ACCEPTED",
            DocumentState::Rejected => "REJECTED",
            DocumentState::Cancelled => "CANCELLED",
        }
    }

    /// States reachable in one step from `self`.
    pub fn allowed_transitions(&self) -> &'static [DocumentState] {
        use DocumentState::*;
        match self {
            Draft => &[Validated, Cancelled],
            Validated => &[Queued, Submitted, Cancelled],
            Queued => &[Submitted, Cancelled],
            Submitted => &[Accepted, Rejected, Cancelled],
            Accepted => &[Cancelled],
            Rejected => &[Validated, Cancelled],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: DocumentState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("document state", s))
    }
}

/// Allowed next states for `current`.
pub fn allowed_transitions(current: DocumentState) -> &'static [DocumentState] {
    current.allowed_transitions()
}

/// Whether `current -> target` is in the table.
pub fn is_transition_allowed(current: DocumentState, target: DocumentState) -> bool {
    current.can_transition_to(target)
}

/// Validate a transition from an optional current state.
///
/// A document with no history accepts any state as its initial state.
pub fn check_transition(current: Option<DocumentState>, target: DocumentState) -> DomainResult<()> {
    match current {
        None => Ok(()),
        Some(current) if current.can_transition_to(target) => Ok(()),
        Some(current) => Err(DomainError::invariant(format!(
            "invalid state transition {current} -> {target} (allowed: {})",
            describe(current.allowed_transitions())
        ))),
    }
}

fn describe(states: &[DocumentState]) -> String {
    if states.is_empty() {
        return "none, state is terminal".to_string();
    }
    states.iter().map(DocumentState::as_str).collect::<Vec<_>>().join(", ")
}
