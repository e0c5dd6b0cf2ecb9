//! In-memory invoice event log for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use taxbridge_core::{DocumentId, TenantId};
use taxbridge_documents::InvoiceEvent;

use super::query::{EventFilter, EventLogStats};
use super::store::{EventLogError, EventLogStore, StreamHead};
use crate::pagination::{Page, Pagination};

#[derive(Debug, Default)]
struct Log {
    /// Insertion order.
    events: Vec<InvoiceEvent>,
    /// Index of each document's latest event in `events`.
    heads: HashMap<DocumentId, usize>,
}

impl Log {
    fn stream(&self, document_id: DocumentId) -> impl Iterator<Item = &InvoiceEvent> {
        self.events
            .iter()
            .filter(move |e| e.document_id == document_id)
    }

    /// Matching events oldest first; ties keep insertion order.
    fn chronological(&self, filter: &EventFilter) -> Vec<InvoiceEvent> {
        let mut matching: Vec<InvoiceEvent> = self
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.occurred_at);
        matching
    }
}

/// In-memory event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventLogStore {
    log: RwLock<Log>,
}

impl InMemoryEventLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Log>, EventLogError> {
        self.log
            .read()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLogStore {
    async fn append(&self, event: &InvoiceEvent) -> Result<(), EventLogError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))?;

        let head = log.heads.get(&event.document_id).map(|&i| &log.events[i]);
        if let Some(head) = head {
            if head.tenant_id != event.tenant_id {
                return Err(EventLogError::TenantMismatch {
                    document_id: event.document_id,
                    owner: head.tenant_id,
                });
            }
        }
        let expected = head.map(|h| h.stream_version).unwrap_or(0) + 1;
        if event.stream_version != expected {
            return Err(EventLogError::VersionConflict {
                document_id: event.document_id,
                stream_version: event.stream_version,
            });
        }

        let index = log.events.len();
        log.events.push(event.clone());
        log.heads.insert(event.document_id, index);
        Ok(())
    }

    async fn head(&self, document_id: DocumentId) -> Result<Option<StreamHead>, EventLogError> {
        let log = self.read()?;
        Ok(log
            .heads
            .get(&document_id)
            .map(|&i| StreamHead::of(&log.events[i])))
    }

    async fn history(
        &self,
        document_id: DocumentId,
        pagination: Pagination,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        let log = self.read()?;
        Ok(log
            .stream(document_id)
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect())
    }

    async fn load_stream(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        let log = self.read()?;
        Ok(log.stream(document_id).cloned().collect())
    }

    async fn query(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceEvent>, EventLogError> {
        let mut events = self.read()?.chronological(filter);
        events.reverse();
        Ok(pagination.slice(events))
    }

    async fn scan(&self, filter: &EventFilter) -> Result<Vec<InvoiceEvent>, EventLogError> {
        Ok(self.read()?.chronological(filter))
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<EventLogStats, EventLogError> {
        let log = self.read()?;
        Ok(EventLogStats::from_events(
            log.events
                .iter()
                .filter(|e| tenant_id.is_none_or(|t| t == e.tenant_id)),
        ))
    }
}
