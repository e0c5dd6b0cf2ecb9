//! Job and dead-letter records.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxbridge_core::{DeadLetterId, DocumentId, DomainError, JobId, TenantId};

use super::classify::{ErrorCategory, classify_error};

/// Default priority; lower is more urgent.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Priority given to jobs replayed from the dead-letter queue.
pub const REPLAY_PRIORITY: i32 = 1;

macro_rules! wire_enum {
    ($t:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($t::$variant),)+
                    other => Err(DomainError::unknown_variant($kind, other)),
                }
            }
        }
    };
}

/// Kind of work, used for routing and for `dequeue` filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Send a document to the authority.
    SubmitDocument,
    /// Ask the authority for the outcome of an earlier submission.
    PollSubmissionStatus,
    /// Withdraw a submission.
    CancelSubmission,
    /// Pull a source document from the upstream system.
    FetchSourceDocument,
}

wire_enum!(JobType, "job type", {
    SubmitDocument => "SUBMIT_DOCUMENT",
    PollSubmissionStatus => "POLL_SUBMISSION_STATUS",
    CancelSubmission => "CANCEL_SUBMISSION",
    FetchSourceDocument => "FETCH_SOURCE_DOCUMENT",
});

/// Job status.
///
/// Forward-only: `PENDING -> PROCESSING -> COMPLETED | PENDING (retry) | DLQ`.
/// `FAILED` is part of the persisted vocabulary but this queue never
/// produces it; exhausted jobs go straight to `DLQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
}

wire_enum!(JobStatus, "job status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Dlq => "DLQ",
});

impl JobStatus {
    /// Immutable once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Dlq)
    }

    /// Statuses covered by the idempotency-key uniqueness guarantee.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// Dead-letter entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Pending,
    Resolved,
}

wire_enum!(DeadLetterStatus, "dead letter status", {
    Pending => "PENDING",
    Resolved => "RESOLVED",
});

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    /// Lower is more urgent.
    pub priority: i32,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub first_error_at: Option<DateTime<Utc>>,
    pub related_document_id: Option<DocumentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize an enqueue request as a fresh `PENDING` job.
    pub fn from_request(request: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: request.tenant_id,
            job_type: request.job_type,
            priority: request.priority,
            payload: request.payload,
            idempotency_key: request.idempotency_key,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            next_retry_at: None,
            last_error: None,
            last_error_at: None,
            first_error_at: None,
            related_document_id: request.related_document_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Claimable by `dequeue` at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Dequeue order: priority ascending, then creation time ascending.
    pub fn claim_order(&self) -> (i32, DateTime<Utc>, JobId) {
        (self.priority, self.created_at, self.id)
    }

    /// Decide what a failure does to this job.
    ///
    /// Pure so both backends share it; `retry_delay` is only consulted when
    /// the attempt budget is not exhausted.
    pub fn plan_failure(
        &self,
        error: &str,
        now: DateTime<Utc>,
        retry_delay: impl FnOnce(u32) -> Duration,
    ) -> FailurePlan {
        let attempt = self.attempt_count + 1;
        if attempt >= self.max_attempts {
            FailurePlan::DeadLetter {
                attempt,
                category: classify_error(error),
            }
        } else {
            let delay = retry_delay(attempt);
            let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            FailurePlan::Retry {
                attempt,
                delay,
                next_retry_at,
            }
        }
    }

    /// Apply a failure plan to this job (in-memory state).
    pub fn apply_failure(&mut self, plan: &FailurePlan, error: &str, now: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(now);
        self.first_error_at.get_or_insert(now);
        self.updated_at = now;
        match plan {
            FailurePlan::Retry {
                attempt,
                next_retry_at,
                ..
            } => {
                self.attempt_count = *attempt;
                self.status = JobStatus::Pending;
                self.next_retry_at = Some(*next_retry_at);
            }
            FailurePlan::DeadLetter { attempt, .. } => {
                self.attempt_count = *attempt;
                self.status = JobStatus::Dlq;
                self.next_retry_at = None;
            }
        }
    }
}

/// Enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub idempotency_key: Option<String>,
    /// `None` uses the queue's configured default.
    pub max_attempts: Option<u32>,
    pub related_document_id: Option<DocumentId>,
}

impl NewJob {
    pub fn new(tenant_id: TenantId, job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            tenant_id,
            job_type,
            payload,
            priority: DEFAULT_PRIORITY,
            idempotency_key: None,
            max_attempts: None,
            related_document_id: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn related_document(mut self, document_id: DocumentId) -> Self {
        self.related_document_id = Some(document_id);
        self
    }
}

/// Decision taken by [`Job::plan_failure`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePlan {
    Retry {
        attempt: u32,
        delay: Duration,
        next_retry_at: DateTime<Utc>,
    },
    DeadLetter {
        attempt: u32,
        category: ErrorCategory,
    },
}

/// What `enqueue_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub job_id: JobId,
    /// `false` when an in-flight job with the same idempotency key was returned.
    pub created: bool,
}

impl Enqueued {
    pub fn created(job_id: JobId) -> Self {
        Self {
            job_id,
            created: true,
        }
    }

    pub fn existing(job_id: JobId) -> Self {
        Self {
            job_id,
            created: false,
        }
    }
}

/// What `mark_failed` did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum FailureOutcome {
    #[serde(rename_all = "camelCase")]
    RetryScheduled {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    },
    #[serde(rename_all = "camelCase")]
    DeadLettered {
        dlq_id: DeadLetterId,
        attempts: u32,
        category: ErrorCategory,
    },
}

impl FailureOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailureOutcome::DeadLettered { .. })
    }
}

/// Entry in the dead-letter queue.
///
/// Holds a copy of the job's work; the original job row stays in `DLQ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub related_document_id: Option<DocumentId>,
    pub error_category: ErrorCategory,
    pub status: DeadLetterStatus,
    pub resolved_job_id: Option<JobId>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// Build the entry for a job that has just been moved to `DLQ`.
    pub fn for_job(job: &Job, category: ErrorCategory, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            tenant_id: job.tenant_id,
            job_type: job.job_type,
            payload: job.payload.clone(),
            failure_reason: job.last_error.clone().unwrap_or_default(),
            failure_count: job.attempt_count,
            first_failed_at: job.first_error_at.unwrap_or(now),
            last_failed_at: job.last_error_at.unwrap_or(now),
            related_document_id: job.related_document_id,
            error_category: category,
            status: DeadLetterStatus::Pending,
            resolved_job_id: None,
            resolved_at: None,
        }
    }

    /// The replacement job a manual replay creates.
    pub fn replay_request(&self, default_max_attempts: u32) -> NewJob {
        NewJob {
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            payload: self.payload.clone(),
            priority: REPLAY_PRIORITY,
            idempotency_key: None,
            max_attempts: Some(default_max_attempts),
            related_document_id: self.related_document_id,
        }
    }
}

/// Dead-letter listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<DeadLetterStatus>,
    pub error_category: Option<ErrorCategory>,
    pub job_type: Option<JobType>,
}

impl DeadLetterFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.tenant_id.is_none_or(|t| entry.tenant_id == t)
            && self.status.is_none_or(|s| entry.status == s)
            && self.error_category.is_none_or(|c| entry.error_category == c)
            && self.job_type.is_none_or(|j| entry.job_type == j)
    }
}

/// Queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
    /// Pending jobs whose retry time is still in the future.
    pub scheduled_retries: u64,
    pub by_job_type: BTreeMap<JobType, u64>,
}

impl QueueStats {
    pub fn record(&mut self, status: JobStatus, job_type: JobType, count: u64) {
        self.total += count;
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dlq => self.dlq += count,
        }
        *self.by_job_type.entry(job_type).or_default() += count;
    }
}

/// Dead-letter counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub total: u64,
    pub pending: u64,
    pub resolved: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_job_type: BTreeMap<JobType, u64>,
}

impl DeadLetterStats {
    pub fn record(
        &mut self,
        status: DeadLetterStatus,
        category: ErrorCategory,
        job_type: JobType,
        count: u64,
    ) {
        self.total += count;
        match status {
            DeadLetterStatus::Pending => self.pending += count,
            DeadLetterStatus::Resolved => self.resolved += count,
        }
        *self.by_category.entry(category).or_default() += count;
        *self.by_job_type.entry(job_type).or_default() += count;
    }
}
