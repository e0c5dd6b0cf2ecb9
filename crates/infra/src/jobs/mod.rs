//! Durable job queue with retry, backoff, and dead-letter escalation.
//!
//! - `JobQueue`: the queue contract (in-memory or PostgreSQL)
//! - `BackoffPolicy`: exponential delay with jitter
//! - `classify_error`: dead-letter triage categories
//! - `PublishingJobQueue`: notifies collaborators after each committed change

pub mod backoff;
pub mod classify;
pub mod postgres;
pub mod store;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taxbridge_core::{DeadLetterId, JobId, TenantId};

use crate::notifications::{Notification, NotificationBus, notify};
use crate::pagination::{Page, Pagination};

pub use backoff::{BackoffPolicy, JitterSource};
pub use classify::{ErrorCategory, classify_error};
pub use postgres::PostgresJobQueue;
pub use store::{InMemoryJobQueue, JobQueue, JobQueueError, LEASE_EXPIRED};
pub use types::{
    DEFAULT_PRIORITY, DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeadLetterStatus,
    Enqueued, FailureOutcome, Job, JobStatus, JobType, NewJob, QueueStats, REPLAY_PRIORITY,
};

/// Adapter that publishes notifications after the inner queue commits.
///
/// Publication is best-effort: the queue row is the source of truth.
pub struct PublishingJobQueue<Q> {
    inner: Q,
    bus: NotificationBus,
}

impl<Q> PublishingJobQueue<Q> {
    pub fn new(inner: Q, bus: NotificationBus) -> Self {
        Self { inner, bus }
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }

    fn publish_failure(&self, job_id: JobId, error: &str, outcome: &FailureOutcome) {
        let notification = match outcome {
            FailureOutcome::RetryScheduled {
                attempt,
                next_retry_at,
                ..
            } => Notification::JobRetryScheduled {
                job_id,
                attempt: *attempt,
                next_retry_at: *next_retry_at,
                error: error.to_string(),
            },
            FailureOutcome::DeadLettered {
                dlq_id,
                attempts,
                category,
            } => Notification::JobDeadLettered {
                job_id,
                dlq_id: *dlq_id,
                attempts: *attempts,
                category: *category,
            },
        };
        notify(&self.bus, notification);
    }
}

#[async_trait]
impl<Q> JobQueue for PublishingJobQueue<Q>
where
    Q: JobQueue,
{
    async fn enqueue_job(&self, job: NewJob) -> Result<Enqueued, JobQueueError> {
        let (tenant_id, job_type) = (job.tenant_id, job.job_type);
        let enqueued = self.inner.enqueue_job(job).await?;
        if enqueued.created {
            notify(
                &self.bus,
                Notification::JobEnqueued {
                    job_id: enqueued.job_id,
                    tenant_id,
                    job_type,
                },
            );
        }
        Ok(enqueued)
    }

    async fn dequeue(
        &self,
        limit: usize,
        job_types: Option<&[JobType]>,
    ) -> Result<Vec<Job>, JobQueueError> {
        let jobs = self.inner.dequeue(limit, job_types).await?;
        for job in &jobs {
            notify(
                &self.bus,
                Notification::JobClaimed {
                    job_id: job.id,
                    tenant_id: job.tenant_id,
                    job_type: job.job_type,
                    attempt_count: job.attempt_count,
                },
            );
        }
        Ok(jobs)
    }

    async fn complete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let transitioned = self.inner.complete(job_id).await?;
        if transitioned {
            notify(&self.bus, Notification::JobCompleted { job_id });
        }
        Ok(transitioned)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
    ) -> Result<FailureOutcome, JobQueueError> {
        let outcome = self.inner.mark_failed(job_id, error, backoff).await?;
        self.publish_failure(job_id, error, &outcome);
        Ok(outcome)
    }

    async fn defer(
        &self,
        job_id: JobId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        self.inner.defer(job_id, until, reason).await
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(JobId, FailureOutcome)>, JobQueueError> {
        let outcomes = self.inner.requeue_stale(older_than).await?;
        for (job_id, outcome) in &outcomes {
            self.publish_failure(*job_id, LEASE_EXPIRED, outcome);
        }
        Ok(outcomes)
    }

    async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<JobId, JobQueueError> {
        let new_job_id = self.inner.retry_from_dlq(dlq_id).await?;
        notify(&self.bus, Notification::DeadLetterReplayed { dlq_id, new_job_id });
        Ok(new_job_id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.inner.get_job(job_id).await
    }

    async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobQueueError> {
        self.inner.get_dead_letter(dlq_id).await
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterEntry>, JobQueueError> {
        self.inner.list_dead_letters(filter, pagination).await
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats, JobQueueError> {
        self.inner.stats(tenant_id).await
    }

    async fn dlq_stats(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<DeadLetterStats, JobQueueError> {
        self.inner.dlq_stats(tenant_id).await
    }
}
