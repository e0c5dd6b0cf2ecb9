//! `EventLog`: validated, optimistic appends to a document's lifecycle
//! stream, plus the read side (state, history, stats, replay, export).

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

use taxbridge_core::{DocumentId, EventId, TenantId};
use taxbridge_documents::{
    ActorType, DocumentLifecycle, DocumentState, InvoiceEvent, InvoiceEventType,
};

use super::export::{AuditFormat, render};
use super::query::{EventFilter, EventLogStats};
use super::store::{EventLogError, EventLogStore};
use crate::notifications::{Notification, NotificationBus, notify};
use crate::pagination::{Page, Pagination};

/// How many times `emit` re-reads the stream head after losing a race.
pub const EMIT_ATTEMPTS: usize = 3;

/// A lifecycle event to record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoiceEvent {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub event_type: InvoiceEventType,
    pub new_state: DocumentState,
    pub payload: JsonValue,
    pub actor: String,
    pub actor_type: ActorType,
    pub correlation_id: Option<String>,
}

impl NewInvoiceEvent {
    /// Defaults to an empty payload recorded by the `system` actor.
    pub fn new(
        tenant_id: TenantId,
        document_id: DocumentId,
        event_type: InvoiceEventType,
        new_state: DocumentState,
    ) -> Self {
        Self {
            tenant_id,
            document_id,
            event_type,
            new_state,
            payload: json!({}),
            actor: "system".to_string(),
            actor_type: ActorType::System,
            correlation_id: None,
        }
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>, actor_type: ActorType) -> Self {
        self.actor = actor.into();
        self.actor_type = actor_type;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Document state machine over an append-only event log.
///
/// The current state of a document is always read from its latest event;
/// there is no separately stored state column.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventLogStore>,
    bus: NotificationBus,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    pub fn new(store: Arc<dyn EventLogStore>, bus: NotificationBus) -> Self {
        Self { store, bus }
    }

    /// Record a transition.
    ///
    /// A document without events accepts any state as its first. Otherwise
    /// `new_state` must be allowed from the current state; a rejected
    /// transition writes nothing.
    #[instrument(
        skip(self, request),
        fields(
            document_id = %request.document_id,
            event_type = %request.event_type,
            new_state = %request.new_state
        )
    )]
    pub async fn emit(&self, request: NewInvoiceEvent) -> Result<InvoiceEvent, EventLogError> {
        for _ in 0..EMIT_ATTEMPTS {
            let head = self.store.head(request.document_id).await?;

            if let Some(head) = head {
                if head.tenant_id != request.tenant_id {
                    return Err(EventLogError::TenantMismatch {
                        document_id: request.document_id,
                        owner: head.tenant_id,
                    });
                }
                if !head.state.can_transition_to(request.new_state) {
                    debug!(from = %head.state, "transition rejected");
                    return Err(EventLogError::InvalidTransition {
                        document_id: request.document_id,
                        from: head.state,
                        to: request.new_state,
                        allowed: head.state.allowed_transitions().to_vec(),
                    });
                }
            }

            let now = Utc::now();
            let event = InvoiceEvent {
                id: EventId::new(),
                tenant_id: request.tenant_id,
                document_id: request.document_id,
                stream_version: head.map(|h| h.stream_version).unwrap_or(0) + 1,
                event_type: request.event_type,
                previous_state: head.map(|h| h.state),
                new_state: request.new_state,
                payload: request.payload.clone(),
                actor: request.actor.clone(),
                actor_type: request.actor_type,
                correlation_id: request.correlation_id.clone(),
                occurred_at: head.map_or(now, |h| h.occurred_at.max(now)),
            };

            match self.store.append(&event).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.id,
                        stream_version = event.stream_version,
                        "event recorded"
                    );
                    notify(
                        &self.bus,
                        Notification::DocumentTransitioned {
                            tenant_id: event.tenant_id,
                            document_id: event.document_id,
                            event_id: event.id,
                            event_type: event.event_type,
                            from: event.previous_state,
                            to: event.new_state,
                        },
                    );
                    return Ok(event);
                }
                Err(EventLogError::VersionConflict { stream_version, .. }) => {
                    debug!(stream_version, "concurrent append, re-reading stream head");
                }
                Err(err) => return Err(err),
            }
        }

        Err(EventLogError::Concurrency {
            document_id: request.document_id,
            attempts: EMIT_ATTEMPTS,
        })
    }

    /// State of the latest event, or `None` for an unknown document.
    pub async fn get_current_state(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentState>, EventLogError> {
        Ok(self.store.head(document_id).await?.map(|h| h.state))
    }

    /// Events of one document, oldest first.
    pub async fn get_history(
        &self,
        document_id: DocumentId,
        pagination: Pagination,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        self.store.history(document_id, pagination).await
    }

    /// Filtered events, newest first.
    pub async fn query(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceEvent>, EventLogError> {
        self.store.query(filter, pagination).await
    }

    pub async fn get_stats(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<EventLogStats, EventLogError> {
        self.store.stats(tenant_id).await
    }

    pub fn is_transition_allowed(current: DocumentState, target: DocumentState) -> bool {
        taxbridge_documents::is_transition_allowed(current, target)
    }

    pub fn get_allowed_transitions(current: DocumentState) -> &'static [DocumentState] {
        taxbridge_documents::allowed_transitions(current)
    }

    /// Replay the full stream of a document.
    pub async fn rebuild_state(
        &self,
        document_id: DocumentId,
    ) -> Result<DocumentLifecycle, EventLogError> {
        let events = self.store.load_stream(document_id).await?;
        let lifecycle = DocumentLifecycle::replay(&events);
        if !lifecycle.consistent {
            tracing::warn!(
                document_id = %document_id,
                violations = lifecycle.violations.len(),
                "event stream contains transitions outside the table"
            );
        }
        Ok(lifecycle)
    }

    /// Serialize every matching event, oldest first.
    #[instrument(skip(self, filter), fields(format = %format), err)]
    pub async fn export_audit_log(
        &self,
        filter: &EventFilter,
        format: AuditFormat,
    ) -> Result<String, EventLogError> {
        let events = self.store.scan(filter).await?;
        debug!(events = events.len(), "exporting audit log");
        render(&events, format)
    }
}

#[cfg(test)]
mod tests {
    use taxbridge_events::EventBus;

    use super::*;
    use crate::event_log::InMemoryEventLogStore;
    use crate::notifications::in_memory_bus;

    fn log() -> EventLog {
        EventLog::new(Arc::new(InMemoryEventLogStore::new()), in_memory_bus())
    }

    async fn walk(log: &EventLog, tenant: TenantId, doc: DocumentId, steps: &[(InvoiceEventType, DocumentState)]) {
        for (event_type, state) in steps {
            log.emit(NewInvoiceEvent::new(tenant, doc, *event_type, *state))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn first_event_accepts_any_state() {
        let log = log();
        let doc = DocumentId::new();
        let event = log
            .emit(NewInvoiceEvent::new(
                TenantId::new(),
                doc,
                InvoiceEventType::SubmissionQueued,
                DocumentState::Queued,
            ))
            .await
            .unwrap();

        assert_eq!(event.stream_version, 1);
        assert_eq!(event.previous_state, None);
        assert_eq!(log.get_current_state(doc).await.unwrap(), Some(DocumentState::Queued));
        assert_eq!(log.get_current_state(DocumentId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn disallowed_transition_writes_nothing() {
        let log = log();
        let (tenant, doc) = (TenantId::new(), DocumentId::new());
        walk(&log, tenant, doc, &[(InvoiceEventType::DocumentCreated, DocumentState::Draft)]).await;

        let err = log
            .emit(NewInvoiceEvent::new(
                tenant,
                doc,
                InvoiceEventType::SubmissionStarted,
                DocumentState::Submitted,
            ))
            .await
            .unwrap_err();

        match err {
            EventLogError::InvalidTransition { from, to, allowed, .. } => {
                assert_eq!(from, DocumentState::Draft);
                assert_eq!(to, DocumentState::Submitted);
                assert_eq!(allowed, vec![DocumentState::Validated, DocumentState::Cancelled]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(log.get_current_state(doc).await.unwrap(), Some(DocumentState::Draft));
        assert_eq!(log.get_history(doc, Pagination::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn emit_chains_previous_state_and_time() {
        let log = log();
        let (tenant, doc) = (TenantId::new(), DocumentId::new());
        walk(
            &log,
            tenant,
            doc,
            &[
                (InvoiceEventType::DocumentCreated, DocumentState::Draft),
                (InvoiceEventType::DocumentValidated, DocumentState::Validated),
                (InvoiceEventType::SubmissionStarted, DocumentState::Submitted),
            ],
        )
        .await;

        let history = log.get_history(doc, Pagination::default()).await.unwrap();
        let previous: Vec<_> = history.iter().map(|e| e.previous_state).collect();
        assert_eq!(
            previous,
            vec![None, Some(DocumentState::Draft), Some(DocumentState::Validated)]
        );
        assert!(history.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));
    }

    #[tokio::test]
    async fn rebuild_matches_current_state() {
        let log = log();
        let (tenant, doc) = (TenantId::new(), DocumentId::new());
        walk(
            &log,
            tenant,
            doc,
            &[
                (InvoiceEventType::DocumentCreated, DocumentState::Draft),
                (InvoiceEventType::DocumentValidated, DocumentState::Validated),
                (InvoiceEventType::SubmissionStarted, DocumentState::Submitted),
                (InvoiceEventType::SubmissionAccepted, DocumentState::Accepted),
            ],
        )
        .await;

        let lifecycle = log.rebuild_state(doc).await.unwrap();
        assert_eq!(lifecycle.current_state, Some(DocumentState::Accepted));
        assert_eq!(lifecycle.event_count, 4);
        assert!(lifecycle.consistent);
        assert_eq!(lifecycle.current_state, log.get_current_state(doc).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_tenant_cannot_write_to_document() {
        let log = log();
        let (owner, doc) = (TenantId::new(), DocumentId::new());
        walk(&log, owner, doc, &[(InvoiceEventType::DocumentCreated, DocumentState::Draft)]).await;

        let err = log
            .emit(NewInvoiceEvent::new(
                TenantId::new(),
                doc,
                InvoiceEventType::DocumentCancelled,
                DocumentState::Cancelled,
            ))
            .await
            .unwrap_err();
        assert_eq!(err, EventLogError::TenantMismatch { document_id: doc, owner });
    }

    #[tokio::test]
    async fn concurrent_emits_never_skip_validation() {
        let log = log();
        let (tenant, doc) = (TenantId::new(), DocumentId::new());
        walk(&log, tenant, doc, &[(InvoiceEventType::DocumentCreated, DocumentState::Draft)]).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.emit(NewInvoiceEvent::new(
                    tenant,
                    doc,
                    InvoiceEventType::DocumentValidated,
                    DocumentState::Validated,
                ))
                .await
            }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        // VALIDATED -> VALIDATED is not in the table, so only one writer wins.
        assert_eq!(ok, 1);
        let lifecycle = log.rebuild_state(doc).await.unwrap();
        assert_eq!(lifecycle.event_count, 2);
        assert!(lifecycle.consistent);
    }

    #[tokio::test]
    async fn emit_publishes_transition() {
        let bus = in_memory_bus();
        let sub = bus.subscribe();
        let log = EventLog::new(Arc::new(InMemoryEventLogStore::new()), bus);
        let (tenant, doc) = (TenantId::new(), DocumentId::new());
        walk(&log, tenant, doc, &[(InvoiceEventType::DocumentCreated, DocumentState::Draft)]).await;

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert!(matches!(
            published[0],
            Notification::DocumentTransitioned { to: DocumentState::Draft, from: None, .. }
        ));
    }

    #[tokio::test]
    async fn stats_query_and_export() {
        let log = log();
        let tenant = TenantId::new();
        for _ in 0..3 {
            let doc = DocumentId::new();
            walk(
                &log,
                tenant,
                doc,
                &[
                    (InvoiceEventType::DocumentCreated, DocumentState::Draft),
                    (InvoiceEventType::DocumentValidated, DocumentState::Validated),
                ],
            )
            .await;
        }

        let stats = log.get_stats(Some(tenant)).await.unwrap();
        assert_eq!(stats.total_events, 6);
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.current_states[&DocumentState::Validated], 3);

        let page = log
            .query(
                &EventFilter::for_tenant(tenant).new_state(DocumentState::Draft),
                Pagination::new(Some(2), None),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);

        let csv = log
            .export_audit_log(&EventFilter::for_tenant(tenant), AuditFormat::Csv)
            .await
            .unwrap();
        assert_eq!(csv.lines().count(), 7);
    }

    #[test]
    fn table_helpers_expose_the_fixed_table() {
        assert!(EventLog::is_transition_allowed(DocumentState::Rejected, DocumentState::Validated));
        assert!(!EventLog::is_transition_allowed(DocumentState::Cancelled, DocumentState::Draft));
        assert!(EventLog::get_allowed_transitions(DocumentState::Cancelled).is_empty());
    }
}
