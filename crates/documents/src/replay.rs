//! Derive a document's state purely from its event history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxbridge_core::EventId;

use crate::event::{ActorType, InvoiceEvent, InvoiceEventType};
use crate::lifecycle::DocumentState;

/// One step of a rebuilt timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event_id: EventId,
    pub stream_version: u64,
    pub event_type: InvoiceEventType,
    pub previous_state: Option<DocumentState>,
    pub new_state: DocumentState,
    pub actor: String,
    pub actor_type: ActorType,
    pub occurred_at: DateTime<Utc>,
}

/// A historical step that does not agree with the transition table or with
/// the state recorded on the previous event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionViolation {
    pub stream_version: u64,
    pub from: Option<DocumentState>,
    pub to: DocumentState,
    pub recorded_previous: Option<DocumentState>,
}

/// Result of folding a document's events in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLifecycle {
    pub current_state: Option<DocumentState>,
    pub event_count: u64,
    pub timeline: Vec<TimelineEntry>,
    pub consistent: bool,
    pub violations: Vec<TransitionViolation>,
}

impl DocumentLifecycle {
    pub fn empty() -> Self {
        Self {
            current_state: None,
            event_count: 0,
            timeline: Vec::new(),
            consistent: true,
            violations: Vec::new(),
        }
    }

    /// Fold events that are already in stream order.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a InvoiceEvent>) -> Self {
        let mut lifecycle = Self::empty();
        for event in events {
            lifecycle.apply(event);
        }
        lifecycle
    }

    /// Evolve from a single event.
    ///
    /// The event always wins: the log is the source of truth, violations are
    /// only reported.
    pub fn apply(&mut self, event: &InvoiceEvent) {
        let table_ok = match self.current_state {
            None => true,
            Some(current) => current.can_transition_to(event.new_state),
        };
        if !table_ok || event.previous_state != self.current_state {
            self.consistent = false;
            self.violations.push(TransitionViolation {
                stream_version: event.stream_version,
                from: self.current_state,
                to: event.new_state,
                recorded_previous: event.previous_state,
            });
        }

        self.timeline.push(TimelineEntry {
            event_id: event.id,
            stream_version: event.stream_version,
            event_type: event.event_type,
            previous_state: event.previous_state,
            new_state: event.new_state,
            actor: event.actor.clone(),
            actor_type: event.actor_type,
            occurred_at: event.occurred_at,
        });
        self.current_state = Some(event.new_state);
        self.event_count += 1;
    }
}

impl Default for DocumentLifecycle {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use taxbridge_core::{DocumentId, TenantId};

    fn history(states: &[DocumentState]) -> Vec<InvoiceEvent> {
        let tenant_id = TenantId::new();
        let document_id = DocumentId::new();
        let start = Utc::now();
        let mut previous = None;
        states
            .iter()
            .enumerate()
            .map(|(i, &state)| {
                let event = InvoiceEvent {
                    id: EventId::new(),
                    tenant_id,
                    document_id,
                    stream_version: i as u64 + 1,
                    event_type: InvoiceEventType::DocumentValidated,
                    previous_state: previous,
                    new_state: state,
                    payload: serde_json::json!({}),
                    actor: "tester".into(),
                    actor_type: ActorType::System,
                    correlation_id: None,
                    occurred_at: start + Duration::milliseconds(i as i64),
                };
                previous = Some(state);
                event
            })
            .collect()
    }

    #[test]
    fn happy_path_replays_to_accepted() {
        use DocumentState::*;
        let events = history(&[Draft, Validated, Submitted, Accepted]);
        let lifecycle = DocumentLifecycle::replay(&events);

        assert_eq!(lifecycle.current_state, Some(Accepted));
        assert_eq!(lifecycle.event_count, 4);
        assert_eq!(lifecycle.timeline.len(), 4);
        assert!(lifecycle.consistent);
    }

    #[test]
    fn illegal_step_is_reported_but_applied() {
        use DocumentState::*;
        let events = history(&[Draft, Accepted]);
        let lifecycle = DocumentLifecycle::replay(&events);

        assert_eq!(lifecycle.current_state, Some(Accepted));
        assert!(!lifecycle.consistent);
        assert_eq!(lifecycle.violations.len(), 1);
        assert_eq!(lifecycle.violations[0].stream_version, 2);
    }

    #[test]
    fn empty_history_has_no_state() {
        let lifecycle = DocumentLifecycle::replay(&Vec::<InvoiceEvent>::new());
        assert_eq!(lifecycle.current_state, None);
        assert_eq!(lifecycle.event_count, 0);
        assert!(lifecycle.consistent);
    }

    /// Random walks along the table starting at DRAFT.
    fn legal_walk() -> impl Strategy<Value = Vec<DocumentState>> {
        prop::collection::vec(any::<prop::sample::Index>(), 0..20).prop_map(|choices| {
            let mut walk = vec![DocumentState::Draft];
            for choice in choices {
                let Some(&last) = walk.last() else { break };
                let next = last.allowed_transitions();
                if next.is_empty() {
                    break;
                }
                walk.push(*choice.get(next));
            }
            walk
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: replaying a legal walk is consistent and lands on the walk's last state.
        #[test]
        fn legal_walks_replay_consistently(walk in legal_walk()) {
            let events = history(&walk);
            let lifecycle = DocumentLifecycle::replay(&events);
            prop_assert!(lifecycle.consistent);
            prop_assert_eq!(lifecycle.current_state, walk.last().copied());
            prop_assert_eq!(lifecycle.event_count, walk.len() as u64);
        }
    }
}
