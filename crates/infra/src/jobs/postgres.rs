//! PostgreSQL-backed job queue.
//!
//! ## Concurrency
//!
//! - `dequeue` claims rows with `FOR UPDATE SKIP LOCKED` inside a single
//!   `UPDATE ... RETURNING`, so the claim and the flip to `PROCESSING` are one
//!   statement and concurrent workers skip each other's rows.
//! - `mark_failed` locks the job row, updates it and (on escalation) inserts
//!   the dead-letter row in one transaction; any error rolls both back.
//! - Idempotent enqueue relies on a partial unique index over
//!   `(tenant_id, idempotency_key)` for `PENDING`/`PROCESSING` rows.
//!
//! All timestamps are bound from the application clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, info, instrument, warn};

use taxbridge_core::{DeadLetterId, DocumentId, DomainError, JobId, TenantId};

use super::backoff::{BackoffPolicy, JitterSource};
use super::store::{JobQueue, JobQueueError, LEASE_EXPIRED};
use super::types::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeadLetterStatus, Enqueued,
    FailureOutcome, FailurePlan, Job, JobStatus, JobType, NewJob, QueueStats,
};
use crate::config::QueueConfig;
use crate::pagination::{Page, Pagination};

const JOB_COLUMNS: &str = "id, tenant_id, job_type, priority, payload, idempotency_key, status, \
     attempt_count, max_attempts, next_retry_at, last_error, last_error_at, first_error_at, \
     related_document_id, created_at, updated_at, started_at, completed_at";

const DEAD_LETTER_COLUMNS: &str = "id, original_job_id, tenant_id, job_type, payload, \
     failure_reason, failure_count, first_failed_at, last_failed_at, related_document_id, \
     error_category, status, resolved_job_id, resolved_at";

/// How many times enqueue re-reads after losing an idempotency race.
const ENQUEUE_ATTEMPTS: usize = 3;

/// Postgres job queue.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    config: QueueConfig,
    jitter: Arc<JitterSource>,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            jitter: Arc::new(JitterSource::from_seed(config.jitter_seed)),
            config,
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobQueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn find_in_flight(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<JobId>, JobQueueError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE tenant_id = $1 AND idempotency_key = $2 AND status IN ('PENDING', 'PROCESSING')
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_in_flight", e))?;

        row.map(|r| r.try_get::<uuid::Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("find_in_flight", e))
    }

    async fn insert_job(&self, job: &Job) -> Result<bool, JobQueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, job_type, priority, payload, idempotency_key, status,
                attempt_count, max_attempts, related_document_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7, $8, $9, $9)
            ON CONFLICT (tenant_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status IN ('PENDING', 'PROCESSING')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.idempotency_key.as_deref())
        .bind(job.max_attempts as i32)
        .bind(job.related_document_id.map(uuid::Uuid::from))
        .bind(job.created_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(row.is_some())
    }

    async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, JobQueueError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_status", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job_status", e))?;
                Ok(Some(status.parse().map_err(decode_error)?))
            }
        }
    }

    /// Fail a locked, `PROCESSING` job inside `tx`.
    async fn fail_locked(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        mut job: Job,
        error: &str,
        policy: BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobQueueError> {
        let plan = job.plan_failure(error, now, |attempt| self.jitter.delay(&policy, attempt));
        job.apply_failure(&plan, error, now);

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempt_count = $3,
                next_retry_at = $4,
                last_error = $5,
                last_error_at = $6,
                first_error_at = $7,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.next_retry_at)
        .bind(error)
        .bind(now)
        .bind(job.first_error_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_failed_job", e))?;

        match plan {
            FailurePlan::Retry {
                attempt,
                delay,
                next_retry_at,
            } => {
                info!(job_id = %job.id, attempt, delay_ms = delay.as_millis() as u64, "job retry scheduled");
                Ok(FailureOutcome::RetryScheduled {
                    attempt,
                    next_retry_at,
                    delay,
                })
            }
            FailurePlan::DeadLetter { attempt, category } => {
                let entry = DeadLetterEntry::for_job(&job, category, now);
                insert_dead_letter(tx, &entry).await?;
                warn!(job_id = %job.id, dlq_id = %entry.id, attempts = attempt, category = %category, "job moved to dead-letter queue");
                Ok(FailureOutcome::DeadLettered {
                    dlq_id: entry.id,
                    attempts: attempt,
                    category,
                })
            }
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, job_type = %request.job_type), err)]
    async fn enqueue_job(&self, request: NewJob) -> Result<Enqueued, JobQueueError> {
        let key = request.idempotency_key.clone();
        let job = Job::from_request(request, self.config.default_max_attempts, Utc::now());

        for _ in 0..ENQUEUE_ATTEMPTS {
            if self.insert_job(&job).await? {
                return Ok(Enqueued::created(job.id));
            }
            // Lost to an in-flight job with the same key; it may finish before we look.
            if let Some(key) = key.as_deref() {
                if let Some(existing) = self.find_in_flight(job.tenant_id, key).await? {
                    debug!(job_id = %existing, "idempotent enqueue matched in-flight job");
                    return Ok(Enqueued::existing(existing));
                }
            }
        }

        Err(JobQueueError::Storage(format!(
            "enqueue did not settle after {ENQUEUE_ATTEMPTS} attempts"
        )))
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn dequeue(
        &self,
        limit: usize,
        job_types: Option<&[JobType]>,
    ) -> Result<Vec<Job>, JobQueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let types: Option<Vec<String>> =
            job_types.map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        let rows = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id FROM jobs
                WHERE status = 'PENDING'
                    AND (next_retry_at IS NULL OR next_retry_at <= $1)
                    AND ($2::text[] IS NULL OR job_type = ANY($2))
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'PROCESSING', started_at = $1, updated_at = $1
            FROM next
            WHERE jobs.id = next.id
            RETURNING {}
            "#,
            qualified_job_columns()
        ))
        .bind(now)
        .bind(types)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dequeue", e))?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(Job::claim_order);

        Span::current().record("claimed", jobs.len());
        for job in &jobs {
            debug!(job_id = %job.id, attempt_count = job.attempt_count, "job claimed");
        }
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', completed_at = $2, next_retry_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if updated.rows_affected() == 1 {
            debug!("job completed");
            return Ok(true);
        }
        match self.job_status(job_id).await? {
            None => Err(JobQueueError::NotFound(job_id)),
            Some(JobStatus::Completed) => Ok(false),
            Some(status) => Err(JobQueueError::InvalidTransition {
                job_id,
                status,
                operation: "complete",
            }),
        }
    }

    #[instrument(skip(self, backoff), fields(job_id = %job_id), err)]
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        backoff: Option<BackoffPolicy>,
    ) -> Result<FailureOutcome, JobQueueError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let job = lock_job(&mut tx, job_id)
            .await?
            .ok_or(JobQueueError::NotFound(job_id))?;
        if job.status != JobStatus::Processing {
            return Err(JobQueueError::InvalidTransition {
                job_id,
                status: job.status,
                operation: "fail",
            });
        }

        let outcome = self
            .fail_locked(&mut tx, job, error, backoff.unwrap_or(self.config.backoff), now)
            .await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn defer(
        &self,
        job_id: JobId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING', next_retry_at = $2, last_error = $3, updated_at = $4
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(until)
        .bind(reason)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("defer", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.job_status(job_id).await? {
            None => Err(JobQueueError::NotFound(job_id)),
            Some(status) => Err(JobQueueError::InvalidTransition {
                job_id,
                status,
                operation: "defer",
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(JobId, FailureOutcome)>, JobQueueError> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'PROCESSING' AND started_at < $1 ORDER BY started_at",
        )
        .bind(older_than)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stale", e))?;

        let mut outcomes = Vec::new();
        for row in rows {
            let job_id = JobId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error("find_stale", e))?);
            let mut tx = self.begin().await?;
            // Re-check under the lock; the worker may have finished meanwhile.
            let Some(job) = lock_job(&mut tx, job_id).await? else {
                continue;
            };
            if job.status != JobStatus::Processing || job.started_at.is_none_or(|at| at >= older_than) {
                continue;
            }
            warn!(job_id = %job_id, "processing lease expired");
            let outcome = self
                .fail_locked(&mut tx, job, LEASE_EXPIRED, self.config.backoff, Utc::now())
                .await?;
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
            outcomes.push((job_id, outcome));
        }
        Ok(outcomes)
    }

    #[instrument(skip(self), fields(dlq_id = %dlq_id), err)]
    async fn retry_from_dlq(&self, dlq_id: DeadLetterId) -> Result<JobId, JobQueueError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(dlq_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_dead_letter", e))?;
        let entry = row
            .as_ref()
            .map(dead_letter_from_row)
            .transpose()?
            .ok_or(JobQueueError::DeadLetterNotFound(dlq_id))?;
        if entry.status == DeadLetterStatus::Resolved {
            return Err(JobQueueError::AlreadyResolved(dlq_id));
        }

        let job = Job::from_request(
            entry.replay_request(self.config.default_max_attempts),
            self.config.default_max_attempts,
            now,
        );
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, job_type, priority, payload, status,
                attempt_count, max_attempts, related_document_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7, $8, $8)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.max_attempts as i32)
        .bind(job.related_document_id.map(uuid::Uuid::from))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_replay_job", e))?;

        sqlx::query(
            "UPDATE dead_letter_jobs SET status = 'RESOLVED', resolved_job_id = $2, resolved_at = $3 WHERE id = $1",
        )
        .bind(dlq_id.as_uuid())
        .bind(job.id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_dead_letter", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        info!(new_job_id = %job.id, "dead letter replayed");
        Ok(job.id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobQueueError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1"
        ))
        .bind(dlq_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Page<DeadLetterEntry>, JobQueueError> {
        let tenant = filter.tenant_id.map(uuid::Uuid::from);
        let status = filter.status.map(|s| s.as_str());
        let category = filter.error_category.map(|c| c.as_str());
        let job_type = filter.job_type.map(|t| t.as_str());

        const WHERE: &str = r#"
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
                AND ($2::text IS NULL OR status = $2)
                AND ($3::text IS NULL OR error_category = $3)
                AND ($4::text IS NULL OR job_type = $4)
        "#;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM dead_letter_jobs {WHERE}"))
            .bind(tenant)
            .bind(status)
            .bind(category)
            .bind(job_type)
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs {WHERE} \
             ORDER BY last_failed_at DESC, id DESC LIMIT $5 OFFSET $6"
        ))
        .bind(tenant)
        .bind(status)
        .bind(category)
        .bind(job_type)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        let items = rows.iter().map(dead_letter_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, pagination))
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats, JobQueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, job_type, COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'PENDING' AND next_retry_at > $2) AS scheduled
            FROM jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status, job_type
            "#,
        )
        .bind(tenant_id.map(uuid::Uuid::from))
        .bind(Utc::now())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let job_type: String = row.try_get("job_type").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let scheduled: i64 = row.try_get("scheduled").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(
                status.parse().map_err(decode_error)?,
                job_type.parse().map_err(decode_error)?,
                total as u64,
            );
            stats.scheduled_retries += scheduled as u64;
        }
        Ok(stats)
    }

    async fn dlq_stats(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<DeadLetterStats, JobQueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, error_category, job_type, COUNT(*) AS total
            FROM dead_letter_jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status, error_category, job_type
            "#,
        )
        .bind(tenant_id.map(uuid::Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_stats", e))?;

        let mut stats = DeadLetterStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("dlq_stats", e))?;
            let category: String =
                row.try_get("error_category").map_err(|e| map_sqlx_error("dlq_stats", e))?;
            let job_type: String = row.try_get("job_type").map_err(|e| map_sqlx_error("dlq_stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("dlq_stats", e))?;
            stats.record(
                status.parse().map_err(decode_error)?,
                category.parse().map_err(decode_error)?,
                job_type.parse().map_err(decode_error)?,
                total as u64,
            );
        }
        Ok(stats)
    }
}

fn qualified_job_columns() -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("jobs.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<Option<Job>, JobQueueError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.as_ref().map(job_from_row).transpose()
}

async fn insert_dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    entry: &DeadLetterEntry,
) -> Result<(), JobQueueError> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_jobs (
            id, original_job_id, tenant_id, job_type, payload, failure_reason, failure_count,
            first_failed_at, last_failed_at, related_document_id, error_category, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'PENDING')
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.original_job_id.as_uuid())
    .bind(entry.tenant_id.as_uuid())
    .bind(entry.job_type.as_str())
    .bind(&entry.payload)
    .bind(&entry.failure_reason)
    .bind(entry.failure_count as i32)
    .bind(entry.first_failed_at)
    .bind(entry.last_failed_at)
    .bind(entry.related_document_id.map(uuid::Uuid::from))
    .bind(entry.error_category.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<Job, JobQueueError> {
    let get = |e| map_sqlx_error("decode_job", e);
    let job_type: String = row.try_get("job_type").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(get)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(get)?;
    let related: Option<uuid::Uuid> = row.try_get("related_document_id").map_err(get)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(get)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        job_type: job_type.parse().map_err(decode_error)?,
        priority: row.try_get("priority").map_err(get)?,
        payload: row.try_get("payload").map_err(get)?,
        idempotency_key: row.try_get("idempotency_key").map_err(get)?,
        status: status.parse().map_err(decode_error)?,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(get)?,
        last_error: row.try_get("last_error").map_err(get)?,
        last_error_at: row.try_get("last_error_at").map_err(get)?,
        first_error_at: row.try_get("first_error_at").map_err(get)?,
        related_document_id: related.map(DocumentId::from_uuid),
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        completed_at: row.try_get("completed_at").map_err(get)?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, JobQueueError> {
    let get = |e| map_sqlx_error("decode_dead_letter", e);
    let job_type: String = row.try_get("job_type").map_err(get)?;
    let category: String = row.try_get("error_category").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let failure_count: i32 = row.try_get("failure_count").map_err(get)?;
    let related: Option<uuid::Uuid> = row.try_get("related_document_id").map_err(get)?;
    let resolved: Option<uuid::Uuid> = row.try_get("resolved_job_id").map_err(get)?;

    Ok(DeadLetterEntry {
        id: DeadLetterId::from_uuid(row.try_get("id").map_err(get)?),
        original_job_id: JobId::from_uuid(row.try_get("original_job_id").map_err(get)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        job_type: job_type.parse().map_err(decode_error)?,
        payload: row.try_get("payload").map_err(get)?,
        failure_reason: row.try_get("failure_reason").map_err(get)?,
        failure_count: failure_count.max(0) as u32,
        first_failed_at: row.try_get("first_failed_at").map_err(get)?,
        last_failed_at: row.try_get("last_failed_at").map_err(get)?,
        related_document_id: related.map(DocumentId::from_uuid),
        error_category: category.parse().map_err(decode_error)?,
        status: status.parse().map_err(decode_error)?,
        resolved_job_id: resolved.map(JobId::from_uuid),
        resolved_at: row.try_get("resolved_at").map_err(get)?,
    })
}

fn decode_error(err: DomainError) -> JobQueueError {
    JobQueueError::Storage(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to `JobQueueError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobQueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "23505" => JobQueueError::Storage(format!(
                    "unique violation in {operation}: {}",
                    db_err.message()
                )),
                "23503" | "23514" => JobQueueError::InvalidArgument(format!(
                    "constraint violation in {operation}: {}",
                    db_err.message()
                )),
                _ => JobQueueError::Storage(format!("database error in {operation}: {}", db_err.message())),
            }
        }
        sqlx::Error::PoolClosed => JobQueueError::Storage(format!("connection pool closed in {operation}")),
        other => JobQueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
