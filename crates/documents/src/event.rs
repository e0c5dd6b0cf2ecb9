//! Lifecycle events recorded against a document.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxbridge_core::{DocumentId, DomainError, EventId, TenantId};

use crate::lifecycle::DocumentState;

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceEventType {
    DocumentCreated,
    DocumentValidated,
    ValidationFailed,
    SubmissionQueued,
    SubmissionStarted,
    SubmissionAccepted,
    SubmissionRejected,
    SubmissionFailed,
    DocumentResubmitted,
    DocumentCancelled,
}

impl InvoiceEventType {
    pub const ALL: [InvoiceEventType; 10] = [
        InvoiceEventType::DocumentCreated,
        InvoiceEventType::DocumentValidated,
        InvoiceEventType::ValidationFailed,
        InvoiceEventType::SubmissionQueued,
        InvoiceEventType::SubmissionStarted,
        InvoiceEventType::SubmissionAccepted,
        InvoiceEventType::SubmissionRejected,
        InvoiceEventType::SubmissionFailed,
        InvoiceEventType::DocumentResubmitted,
        InvoiceEventType::DocumentCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceEventType::DocumentCreated => "DOCUMENT_CREATED",
            InvoiceEventType::DocumentValidated => "DOCUMENT_VALIDATED",
            InvoiceEventType::ValidationFailed => "VALIDATION_FAILED",
            InvoiceEventType::SubmissionQueued => "SUBMISSION_QUEUED",
            InvoiceEventType::SubmissionStarted => "SUBMISSION_STARTED",
            InvoiceEventType::SubmissionAccepted => "SUBMISSION_ACCEPTED",
            InvoiceEventType::SubmissionRejected => "SUBMISSION_REJECTED",
            InvoiceEventType::SubmissionFailed => "SUBMISSION_FAILED",
            InvoiceEventType::DocumentResubmitted => "DOCUMENT_RESUBMITTED",
            InvoiceEventType::DocumentCancelled => "DOCUMENT_CANCELLED",
        }
    }
}

impl fmt::Display for InvoiceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("event type", s))
    }
}

/// Who caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    User,
    System,
    Api,
    Cron,
}

impl ActorType {
    pub const ALL: [ActorType; 4] = [ActorType::User, ActorType::System, ActorType::Api, ActorType::Cron];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "USER",
            ActorType::System => "SYSTEM",
            ActorType::Api => "API",
            ActorType::Cron => "CRON",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActorType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("actor type", s))
    }
}

/// One appended, immutable lifecycle event.
///
/// `stream_version` is the 1-based position of the event within its
/// document's stream; together with `occurred_at` it defines the order used
/// for current-state derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub stream_version: u64,
    pub event_type: InvoiceEventType,
    pub previous_state: Option<DocumentState>,
    pub new_state: DocumentState,
    pub payload: serde_json::Value,
    pub actor: String,
    pub actor_type: ActorType,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
