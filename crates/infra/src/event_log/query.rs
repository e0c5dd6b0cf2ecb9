//! Filters and aggregates over the invoice event log.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxbridge_core::{DocumentId, TenantId};
use taxbridge_documents::{ActorType, DocumentState, InvoiceEvent, InvoiceEventType};

/// Filter criteria for event queries and exports. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub tenant_id: Option<TenantId>,
    pub document_id: Option<DocumentId>,
    pub event_type: Option<InvoiceEventType>,
    pub new_state: Option<DocumentState>,
    pub actor: Option<String>,
    pub actor_type: Option<ActorType>,
    pub correlation_id: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub occurred_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn for_document(document_id: DocumentId) -> Self {
        Self {
            document_id: Some(document_id),
            ..Self::default()
        }
    }

    pub fn event_type(mut self, event_type: InvoiceEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn new_state(mut self, state: DocumentState) -> Self {
        self.new_state = Some(state);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = Some(actor_type);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.occurred_after = Some(after);
        self.occurred_before = Some(before);
        self
    }

    pub fn matches(&self, event: &InvoiceEvent) -> bool {
        self.tenant_id.is_none_or(|t| t == event.tenant_id)
            && self.document_id.is_none_or(|d| d == event.document_id)
            && self.event_type.is_none_or(|t| t == event.event_type)
            && self.new_state.is_none_or(|s| s == event.new_state)
            && self.actor.as_deref().is_none_or(|a| a == event.actor)
            && self.actor_type.is_none_or(|t| t == event.actor_type)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| event.correlation_id.as_deref() == Some(c))
            && self.occurred_after.is_none_or(|t| event.occurred_at >= t)
            && self.occurred_before.is_none_or(|t| event.occurred_at < t)
    }
}

/// Aggregated counts over the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogStats {
    pub total_events: u64,
    /// Distinct documents with at least one event.
    pub documents: u64,
    pub by_event_type: BTreeMap<InvoiceEventType, u64>,
    pub by_new_state: BTreeMap<DocumentState, u64>,
    pub by_actor_type: BTreeMap<ActorType, u64>,
    /// Documents grouped by their current state.
    pub current_states: BTreeMap<DocumentState, u64>,
}

impl EventLogStats {
    /// Fold a chronologically ordered event sequence into stats.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a InvoiceEvent>) -> Self {
        let mut stats = Self::default();
        let mut latest: BTreeMap<DocumentId, DocumentState> = BTreeMap::new();
        for event in events {
            stats.total_events += 1;
            *stats.by_event_type.entry(event.event_type).or_default() += 1;
            *stats.by_new_state.entry(event.new_state).or_default() += 1;
            *stats.by_actor_type.entry(event.actor_type).or_default() += 1;
            latest.insert(event.document_id, event.new_state);
        }
        stats.documents = latest.len() as u64;
        for state in latest.into_values() {
            *stats.current_states.entry(state).or_default() += 1;
        }
        stats
    }

    /// Event types never seen so far.
    pub fn unused_event_types(&self) -> BTreeSet<InvoiceEventType> {
        InvoiceEventType::ALL
            .into_iter()
            .filter(|t| !self.by_event_type.contains_key(t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use taxbridge_core::EventId;

    use super::*;

    fn event(
        tenant_id: TenantId,
        document_id: DocumentId,
        version: u64,
        event_type: InvoiceEventType,
        new_state: DocumentState,
        at: DateTime<Utc>,
    ) -> InvoiceEvent {
        InvoiceEvent {
            id: EventId::new(),
            tenant_id,
            document_id,
            stream_version: version,
            event_type,
            previous_state: None,
            new_state,
            payload: json!({}),
            actor: "erp-sync".to_string(),
            actor_type: ActorType::System,
            correlation_id: Some("batch-7".to_string()),
            occurred_at: at,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let e = event(
            TenantId::new(),
            DocumentId::new(),
            1,
            InvoiceEventType::DocumentCreated,
            DocumentState::Draft,
            Utc::now(),
        );
        assert!(EventFilter::default().matches(&e));
    }

    #[test]
    fn filter_fields_are_conjunctive() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let e = event(
            tenant,
            DocumentId::new(),
            1,
            InvoiceEventType::DocumentValidated,
            DocumentState::Validated,
            now,
        );

        let filter = EventFilter::for_tenant(tenant).new_state(DocumentState::Validated);
        assert!(filter.matches(&e));
        assert!(!filter.clone().event_type(InvoiceEventType::DocumentCreated).matches(&e));
        assert!(!EventFilter::for_tenant(TenantId::new()).matches(&e));
        assert!(filter.clone().correlation_id("batch-7").matches(&e));
        assert!(!filter.correlation_id("batch-8").matches(&e));
    }

    #[test]
    fn time_window_is_half_open() {
        let now = Utc::now();
        let e = event(
            TenantId::new(),
            DocumentId::new(),
            1,
            InvoiceEventType::DocumentCreated,
            DocumentState::Draft,
            now,
        );
        assert!(EventFilter::default().between(now, now + Duration::seconds(1)).matches(&e));
        assert!(!EventFilter::default().between(now - Duration::seconds(1), now).matches(&e));
    }

    #[test]
    fn stats_count_documents_and_current_states() {
        let tenant = TenantId::new();
        let (a, b) = (DocumentId::new(), DocumentId::new());
        let now = Utc::now();
        let events = vec![
            event(tenant, a, 1, InvoiceEventType::DocumentCreated, DocumentState::Draft, now),
            event(tenant, b, 1, InvoiceEventType::DocumentCreated, DocumentState::Draft, now),
            event(tenant, a, 2, InvoiceEventType::DocumentValidated, DocumentState::Validated, now),
        ];

        let stats = EventLogStats::from_events(&events);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.by_event_type[&InvoiceEventType::DocumentCreated], 2);
        assert_eq!(stats.by_new_state[&DocumentState::Validated], 1);
        assert_eq!(stats.by_actor_type[&ActorType::System], 3);
        assert_eq!(stats.current_states[&DocumentState::Draft], 1);
        assert_eq!(stats.current_states[&DocumentState::Validated], 1);
        assert!(stats.unused_event_types().contains(&InvoiceEventType::SubmissionAccepted));
    }
}
