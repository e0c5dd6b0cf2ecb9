//! Job queue contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taxbridge_core::{DeadLetterId, JobId, TenantId};

use super::backoff::{BackoffPolicy, JitterSource};
use super::types::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeadLetterStatus, Enqueued,
    FailureOutcome, FailurePlan, Job, JobStatus, JobType, NewJob, QueueStats,
};
use crate::config::QueueConfig;
use crate::pagination::{Page, Pagination};

/// Error message recorded for jobs recovered by [`JobQueue::requeue_stale`].
pub const LEASE_EXPIRED: &str = "processing lease expired";

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("dead letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// The operation is not legal from the job's current status.
    #[error("cannot {operation} job {job_id} in status {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("dead letter entry {0} is already resolved")]
    AlreadyResolved(DeadLetterId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable priority queue with retry scheduling and dead-letter escalation.
///
/// All time-based decisions use the queue's clock at call time. Retries are
/// polling-based: a job becomes claimable again once `next_retry_at <= now`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a `PENDING` job.
    ///
    /// With an idempotency key, returns the id of an existing `PENDING` or
    /// `PROCESSING` job for the same tenant and key instead of inserting;
    /// `created` tells the two cases apart.
    async fn enqueue_job(&self, job: NewJob) -> Result<Enqueued, JobQueueError>;

    /// [`enqueue_job`](Self::enqueue_job) without the outcome.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobQueueError> {
        Ok(self.enqueue_job(job).await?.job_id)
    }

    /// Claim up to `limit` ready jobs, flipping them to `PROCESSING`.
    ///
    /// No two concurrent callers ever receive the same job.
    async fn dequeue(
        &self,
        limit: usize,
        job_types: Option<&[JobType]>,
    ) -> Result<Vec<Job>, JobQueueError>;

    /// `PROCESSING -> COMPLETED`; a no-op if already `COMPLETED`.
    ///
    /// Returns `true` only when this call made the transition.
    async fn complete(&self, job_id: JobId) -> Result<bool, JobQueueError>;

    /// [`complete`](Self::complete) without the outcome.
    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobQueueError> {
        self.complete(job_id).await.map(|_| ())
    }

    /// Record a failed attempt.
    ///
    /// Schedules a retry with `backoff` (or the queue default), or moves the
    /// job to `DLQ` together with a new dead-letter entry in one atomic unit.
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
    ) -> Result<FailureOutcome, JobQueueError>;

    /// Hand a claimed job back without consuming an attempt.
    async fn defer(
        &self,
        job_id: JobId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobQueueError>;

    /// Fail every `PROCESSING` job claimed before `older_than`.
    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(JobId, FailureOutcome)>, JobQueueError>;

    /// Replay a dead-lettered job as a brand-new job (priority 1, 0 attempts).
    async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<JobId, JobQueueError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError>;

    async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobQueueError>;

    /// Newest failures first.
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterEntry>, JobQueueError>;

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats, JobQueueError>;

    async fn dlq_stats(&self, tenant_id: Option<TenantId>)
    -> Result<DeadLetterStats, JobQueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue_job(&self, job: NewJob) -> Result<Enqueued, JobQueueError> {
        (**self).enqueue_job(job).await
    }

    async fn dequeue(
        &self,
        limit: usize,
        job_types: Option<&[JobType]>,
    ) -> Result<Vec<Job>, JobQueueError> {
        (**self).dequeue(limit, job_types).await
    }

    async fn complete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        (**self).complete(job_id).await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
    ) -> Result<FailureOutcome, JobQueueError> {
        (**self).mark_failed(job_id, error, backoff).await
    }

    async fn defer(
        &self,
        job_id: JobId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        (**self).defer(job_id, until, reason).await
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(JobId, FailureOutcome)>, JobQueueError> {
        (**self).requeue_stale(older_than).await
    }

    async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<JobId, JobQueueError> {
        (**self).retry_from_dlq(dlq_id).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        (**self).get_job(job_id).await
    }

    async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobQueueError> {
        (**self).get_dead_letter(dlq_id).await
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterEntry>, JobQueueError> {
        (**self).list_dead_letters(filter, pagination).await
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats, JobQueueError> {
        (**self).stats(tenant_id).await
    }

    async fn dlq_stats(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<DeadLetterStats, JobQueueError> {
        (**self).dlq_stats(tenant_id).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

impl QueueState {
    fn in_flight_with_key(&self, tenant_id: TenantId, key: &str) -> Option<JobId> {
        self.jobs
            .values()
            .find(|j| {
                j.tenant_id == tenant_id
                    && j.status.is_in_flight()
                    && j.idempotency_key.as_deref() == Some(key)
            })
            .map(|j| j.id)
    }
}

/// In-memory job queue for tests/dev.
///
/// One mutex guards jobs and dead letters together, which gives `dequeue` its
/// exclusivity and makes DLQ escalation all-or-nothing.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    jitter: JitterSource,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            jitter: JitterSource::from_seed(config.jitter_seed),
            config,
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, JobQueueError> {
        self.state
            .lock()
            .map_err(|_| JobQueueError::Storage("job queue lock poisoned".to_string()))
    }

    fn fail_locked(
        &self,
        state: &mut QueueState,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobQueueError> {
        let job = state.jobs.get(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        if job.status != JobStatus::Processing {
            return Err(JobQueueError::InvalidTransition {
                job_id,
                status: job.status,
                operation: "fail",
            });
        }

        let policy = backoff.unwrap_or(self.config.backoff);
        let plan = job.plan_failure(error, now, |attempt| self.jitter.delay(&policy, attempt));

        // Build everything before mutating so a failure leaves no partial state.
        let mut updated = job.clone();
        updated.apply_failure(&plan, error, now);

        let outcome = match plan {
            FailurePlan::Retry {
                attempt,
                delay,
                next_retry_at,
            } => FailureOutcome::RetryScheduled {
                attempt,
                next_retry_at,
                delay,
            },
            FailurePlan::DeadLetter { attempt, category } => {
                let entry = DeadLetterEntry::for_job(&updated, category, now);
                let outcome = FailureOutcome::DeadLettered {
                    dlq_id: entry.id,
                    attempts: attempt,
                    category,
                };
                state.dead_letters.insert(entry.id, entry);
                outcome
            }
        };
        state.jobs.insert(job_id, updated);
        Ok(outcome)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue_job(&self, request: NewJob) -> Result<Enqueued, JobQueueError> {
        let mut state = self.lock()?;
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = state.in_flight_with_key(request.tenant_id, key) {
                return Ok(Enqueued::existing(existing));
            }
        }

        let job = Job::from_request(request, self.config.default_max_attempts, Utc::now());
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(Enqueued::created(id))
    }

    async fn dequeue(
        &self,
        limit: usize,
        job_types: Option<&[JobType]>,
    ) -> Result<Vec<Job>, JobQueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.lock()?;
        let now = Utc::now();

        let mut ready: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now) && job_types.is_none_or(|types| types.contains(&j.job_type)))
            .map(|j| (j.claim_order(), j.id))
            .collect();
        ready.sort();
        ready.truncate(limit);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        match job.status {
            JobStatus::Completed => Ok(false),
            JobStatus::Processing => {
                let now = Utc::now();
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.next_retry_at = None;
                job.updated_at = now;
                Ok(true)
            }
            status => Err(JobQueueError::InvalidTransition {
                job_id,
                status,
                operation: "complete",
            }),
        }
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
    ) -> Result<FailureOutcome, JobQueueError> {
        let mut state = self.lock()?;
        self.fail_locked(&mut state, job_id, error, backoff, Utc::now())
    }

    async fn defer(
        &self,
        job_id: JobId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        if job.status != JobStatus::Processing {
            return Err(JobQueueError::InvalidTransition {
                job_id,
                status: job.status,
                operation: "defer",
            });
        }
        let now = Utc::now();
        job.status = JobStatus::Pending;
        job.next_retry_at = Some(until);
        job.last_error = Some(reason.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(JobId, FailureOutcome)>, JobQueueError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing && j.started_at.is_some_and(|at| at < older_than)
            })
            .map(|j| j.id)
            .collect();

        let mut outcomes = Vec::with_capacity(stale.len());
        for job_id in stale {
            let outcome = self.fail_locked(&mut state, job_id, LEASE_EXPIRED, None, now)?;
            outcomes.push((job_id, outcome));
        }
        Ok(outcomes)
    }

    async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<JobId, JobQueueError> {
        let mut state = self.lock()?;
        let entry = state
            .dead_letters
            .get(&dlq_id)
            .ok_or(JobQueueError::DeadLetterNotFound(dlq_id))?;
        if entry.status == DeadLetterStatus::Resolved {
            return Err(JobQueueError::AlreadyResolved(dlq_id));
        }

        let now = Utc::now();
        let job = Job::from_request(
            entry.replay_request(self.config.default_max_attempts),
            self.config.default_max_attempts,
            now,
        );
        let new_id = job.id;
        state.jobs.insert(new_id, job);

        if let Some(entry) = state.dead_letters.get_mut(&dlq_id) {
            entry.status = DeadLetterStatus::Resolved;
            entry.resolved_job_id = Some(new_id);
            entry.resolved_at = Some(now);
        }
        Ok(new_id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobQueueError> {
        Ok(self.lock()?.dead_letters.get(&dlq_id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterEntry>, JobQueueError> {
        let state = self.lock()?;
        let mut entries: Vec<_> = state
            .dead_letters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at).then(b.id.cmp(&a.id)));
        Ok(pagination.slice(entries))
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats, JobQueueError> {
        let state = self.lock()?;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for job in state.jobs.values().filter(|j| tenant_id.is_none_or(|t| j.tenant_id == t)) {
            stats.record(job.status, job.job_type, 1);
            if job.status == JobStatus::Pending && job.next_retry_at.is_some_and(|at| at > now) {
                stats.scheduled_retries += 1;
            }
        }
        Ok(stats)
    }

    async fn dlq_stats(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<DeadLetterStats, JobQueueError> {
        let state = self.lock()?;
        let mut stats = DeadLetterStats::default();
        for entry in state
            .dead_letters
            .values()
            .filter(|e| tenant_id.is_none_or(|t| e.tenant_id == t))
        {
            stats.record(entry.status, entry.error_category, entry.job_type, 1);
        }
        Ok(stats)
    }
}
