//! Notifications published to collaborators after state changes commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxbridge_core::{DeadLetterId, DocumentId, EventId, JobId, TenantId};
use taxbridge_documents::{DocumentState, InvoiceEventType};
use taxbridge_events::{EventBus, InMemoryEventBus, publish_best_effort};

use crate::circuit::CircuitState;
use crate::jobs::{ErrorCategory, JobType};

/// Shared handle to the notification bus.
pub type NotificationBus = Arc<dyn EventBus<Notification>>;

/// In-process bus. Each subscriber buffers up to
/// [`DEFAULT_SUBSCRIBER_CAPACITY`](taxbridge_events::DEFAULT_SUBSCRIBER_CAPACITY)
/// notifications and is disconnected if it stops draining.
pub fn in_memory_bus() -> NotificationBus {
    Arc::new(InMemoryEventBus::<Notification>::new())
}

/// Publish on a shared bus, logging instead of failing.
pub fn notify(bus: &NotificationBus, notification: Notification) {
    publish_best_effort(bus.as_ref(), notification);
}

/// Something observable happened in the queue, a circuit or a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    JobEnqueued {
        job_id: JobId,
        tenant_id: TenantId,
        job_type: JobType,
    },
    #[serde(rename_all = "camelCase")]
    JobClaimed {
        job_id: JobId,
        tenant_id: TenantId,
        job_type: JobType,
        attempt_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted { job_id: JobId },
    #[serde(rename_all = "camelCase")]
    JobRetryScheduled {
        job_id: JobId,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    JobDeadLettered {
        job_id: JobId,
        dlq_id: DeadLetterId,
        attempts: u32,
        category: ErrorCategory,
    },
    #[serde(rename_all = "camelCase")]
    DeadLetterReplayed {
        dlq_id: DeadLetterId,
        new_job_id: JobId,
    },
    #[serde(rename_all = "camelCase")]
    CircuitTransitioned {
        service: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    DocumentTransitioned {
        tenant_id: TenantId,
        document_id: DocumentId,
        event_id: EventId,
        event_type: InvoiceEventType,
        from: Option<DocumentState>,
        to: DocumentState,
    },
}
