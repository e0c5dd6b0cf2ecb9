//! Storage contract for lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taxbridge_core::{DocumentId, TenantId};
use taxbridge_documents::{DocumentState, InvoiceEvent};

use super::query::{EventFilter, EventLogStats};
use crate::pagination::{Page, Pagination};

/// Event log error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventLogError {
    /// The target state is not reachable from the document's current state.
    #[error("invalid state transition {from} -> {to} for document {document_id}")]
    InvalidTransition {
        document_id: DocumentId,
        from: DocumentState,
        to: DocumentState,
        allowed: Vec<DocumentState>,
    },

    #[error("document {document_id} belongs to tenant {owner}")]
    TenantMismatch {
        document_id: DocumentId,
        owner: TenantId,
    },

    /// Another writer appended at this stream version first.
    #[error("stream version {stream_version} of document {document_id} already exists")]
    VersionConflict {
        document_id: DocumentId,
        stream_version: u64,
    },

    /// Optimistic append kept losing to concurrent writers.
    #[error("gave up appending to document {document_id} after {attempts} concurrent writes")]
    Concurrency { document_id: DocumentId, attempts: usize },

    #[error("audit export failed: {0}")]
    Export(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Latest event of a document stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    pub tenant_id: TenantId,
    pub state: DocumentState,
    pub stream_version: u64,
    pub occurred_at: DateTime<Utc>,
}

impl StreamHead {
    pub fn of(event: &InvoiceEvent) -> Self {
        Self {
            tenant_id: event.tenant_id,
            state: event.new_state,
            stream_version: event.stream_version,
            occurred_at: event.occurred_at,
        }
    }
}

/// Append-only storage for invoice events.
///
/// Streams are keyed by document. `append` is optimistic: it succeeds only
/// when `event.stream_version` is exactly one past the stored head, and
/// reports [`EventLogError::VersionConflict`] otherwise. Transition
/// validation happens above this layer.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn append(&self, event: &InvoiceEvent) -> Result<(), EventLogError>;

    async fn head(&self, document_id: DocumentId) -> Result<Option<StreamHead>, EventLogError>;

    /// Events of one document in stream order.
    async fn history(
        &self,
        document_id: DocumentId,
        pagination: Pagination,
    ) -> Result<Vec<InvoiceEvent>, EventLogError>;

    /// The full stream of one document.
    async fn load_stream(&self, document_id: DocumentId)
    -> Result<Vec<InvoiceEvent>, EventLogError>;

    /// Newest first.
    async fn query(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceEvent>, EventLogError>;

    /// Every matching event, oldest first.
    async fn scan(&self, filter: &EventFilter) -> Result<Vec<InvoiceEvent>, EventLogError>;

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<EventLogStats, EventLogError>;
}

#[async_trait]
impl<S> EventLogStore for Arc<S>
where
    S: EventLogStore + ?Sized,
{
    async fn append(&self, event: &InvoiceEvent) -> Result<(), EventLogError> {
        (**self).append(event).await
    }

    async fn head(&self, document_id: DocumentId) -> Result<Option<StreamHead>, EventLogError> {
        (**self).head(document_id).await
    }

    async fn history(
        &self,
        document_id: DocumentId,
        pagination: Pagination,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        (**self).history(document_id, pagination).await
    }

    async fn load_stream(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        (**self).load_stream(document_id).await
    }

    async fn query(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceEvent>, EventLogError> {
        (**self).query(filter, pagination).await
    }

    async fn scan(&self, filter: &EventFilter) -> Result<Vec<InvoiceEvent>, EventLogError> {
        (**self).scan(filter).await
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<EventLogStats, EventLogError> {
        (**self).stats(tenant_id).await
    }
}
