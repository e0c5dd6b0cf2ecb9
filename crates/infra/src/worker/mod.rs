//! Worker loop: claim jobs, call the authority through the circuit breaker,
//! record the outcome on the queue and in the document's event log.

pub mod submitter;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taxbridge_core::JobId;
use taxbridge_documents::{ActorType, DocumentState, InvoiceEventType};

use crate::circuit::{CircuitBreaker, CircuitError};
use crate::config::WorkerConfig;
use crate::event_log::{EventLog, EventLogError, NewInvoiceEvent};
use crate::jobs::{FailureOutcome, Job, JobQueue, JobQueueError};

pub use submitter::{SubmissionError, Submitter};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    RetryScheduled,
    DeadLettered,
    /// Handed back without spending an attempt (circuit open).
    Deferred,
}

/// Result of one [`Worker::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retry_scheduled: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    /// Abandoned PROCESSING jobs failed back into the queue.
    pub stale_requeued: usize,
    /// Jobs whose queue bookkeeping failed; they stay PROCESSING until the
    /// stale sweep picks them up.
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::RetryScheduled => self.retry_scheduled += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Cumulative statistics of a spawned worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_deferred: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.jobs_claimed += report.claimed as u64;
        self.jobs_completed += report.completed as u64;
        self.jobs_retried += (report.retry_scheduled + report.stale_requeued) as u64;
        self.jobs_dead_lettered += report.dead_lettered as u64;
        self.jobs_deferred += report.deferred as u64;
        self.errors += report.errors as u64;
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming new batches, wait for the current one to finish and
    /// return the final counters.
    /// A loop that died from a panic is logged here.
    pub async fn shutdown(mut self) -> WorkerStats {
        // The loop may already be gone; the join below reports why.
        let _ = self.shutdown.send(true);
        if let Err(err) = (&mut self.join).await {
            if err.is_panic() {
                error!(error = %err, "worker loop panicked");
            } else {
                error!(error = %err, "worker loop was cancelled");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Composition root of the submission pipeline.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    breaker: CircuitBreaker,
    events: EventLog,
    submitter: Arc<dyn Submitter>,
    config: WorkerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        breaker: CircuitBreaker,
        events: EventLog,
        submitter: Arc<dyn Submitter>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            breaker,
            events,
            submitter,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Sweep stale jobs, then claim and process one batch.
    pub async fn run_once(&self) -> Result<BatchReport, WorkerError> {
        let mut report = BatchReport::default();
        report.stale_requeued = self.sweep_stale().await;

        let jobs = self
            .queue
            .dequeue(self.config.batch_size as usize, self.config.job_types.as_deref())
            .await?;
        report.claimed = jobs.len();

        for job in jobs {
            debug!(
                worker = %self.config.name,
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count + 1,
                "claimed job"
            );
            match self.process(&job).await {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    report.errors += 1;
                    error!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        error = %err,
                        "job bookkeeping failed"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, job: &Job) -> Result<JobOutcome, WorkerError> {
        let service = self.config.service.as_str();
        let result = self
            .breaker
            .execute(service, || async {
                self.record_submission_started(job).await;
                self.submitter.submit(job).await
            })
            .await;

        match result {
            Ok(response) => {
                self.queue.mark_completed(job.id).await?;
                debug!(worker = %self.config.name, job_id = %job.id, "job completed");
                self.record_transition(
                    job,
                    InvoiceEventType::SubmissionAccepted,
                    DocumentState::Accepted,
                    json!({ "jobId": job.id, "response": response }),
                )
                .await;
                Ok(JobOutcome::Completed)
            }
            Err(CircuitError::Open {
                service,
                retry_after,
            }) => {
                let until = Utc::now()
                    + ChronoDuration::from_std(retry_after).unwrap_or(ChronoDuration::zero());
                self.queue
                    .defer(job.id, until, &format!("circuit open for {service}"))
                    .await?;
                debug!(job_id = %job.id, %until, "circuit open, job deferred");
                Ok(JobOutcome::Deferred)
            }
            Err(CircuitError::Store(err)) => {
                let until = Utc::now()
                    + ChronoDuration::from_std(self.config.poll_interval)
                        .unwrap_or(ChronoDuration::zero());
                error!(job_id = %job.id, error = %err, "circuit state unavailable, job deferred");
                self.queue
                    .defer(job.id, until, "circuit state unavailable")
                    .await?;
                Ok(JobOutcome::Deferred)
            }
            Err(CircuitError::Inner(err)) => {
                let outcome = self.queue.mark_failed(job.id, err.message(), None).await?;
                Ok(self.record_failure(job, err.message(), outcome).await)
            }
        }
    }

    async fn record_failure(&self, job: &Job, error: &str, outcome: FailureOutcome) -> JobOutcome {
        match outcome {
            FailureOutcome::RetryScheduled {
                attempt,
                next_retry_at,
                ..
            } => {
                info!(job_id = %job.id, attempt, %next_retry_at, error, "submission failed, retry scheduled");
                JobOutcome::RetryScheduled
            }
            FailureOutcome::DeadLettered {
                dlq_id,
                attempts,
                category,
            } => {
                warn!(job_id = %job.id, %dlq_id, attempts, %category, error, "submission dead-lettered");
                self.record_transition(
                    job,
                    InvoiceEventType::SubmissionFailed,
                    DocumentState::Rejected,
                    json!({
                        "jobId": job.id,
                        "dlqId": dlq_id,
                        "attempts": attempts,
                        "errorCategory": category,
                        "error": error,
                    }),
                )
                .await;
                JobOutcome::DeadLettered
            }
        }
    }

    /// Fail abandoned PROCESSING jobs back through the retry path.
    async fn sweep_stale(&self) -> usize {
        let stale_after = ChronoDuration::from_std(self.config.stale_after)
            .unwrap_or(ChronoDuration::zero());
        let requeued = match self.queue.requeue_stale(Utc::now() - stale_after).await {
            Ok(requeued) => requeued,
            Err(err) => {
                error!(worker = %self.config.name, error = %err, "stale job sweep failed");
                return 0;
            }
        };

        for (job_id, outcome) in &requeued {
            warn!(worker = %self.config.name, %job_id, "requeued abandoned job");
            if outcome.is_dead_lettered() {
                self.record_stale_dead_letter(*job_id, outcome.clone()).await;
            }
        }
        requeued.len()
    }

    async fn record_stale_dead_letter(&self, job_id: JobId, outcome: FailureOutcome) {
        match self.queue.get_job(job_id).await {
            Ok(Some(job)) => {
                self.record_failure(&job, crate::jobs::LEASE_EXPIRED, outcome)
                    .await;
            }
            Ok(None) => {}
            Err(err) => error!(%job_id, error = %err, "failed to load dead-lettered job"),
        }
    }

    /// Move the document to SUBMITTED right before the remote call.
    async fn record_submission_started(&self, job: &Job) {
        let Some(document_id) = job.related_document_id else {
            return;
        };
        let current = match self.events.get_current_state(document_id).await {
            Ok(current) => current,
            Err(err) => {
                error!(%document_id, error = %err, "failed to read document state");
                return;
            }
        };

        if current == Some(DocumentState::Rejected) {
            // A replayed job resubmits a rejected document.
            self.record_transition(
                job,
                InvoiceEventType::DocumentResubmitted,
                DocumentState::Validated,
                json!({ "jobId": job.id }),
            )
            .await;
        }
        if matches!(
            current,
            Some(DocumentState::Queued | DocumentState::Validated | DocumentState::Rejected)
        ) {
            self.record_transition(
                job,
                InvoiceEventType::SubmissionStarted,
                DocumentState::Submitted,
                json!({ "jobId": job.id, "attempt": job.attempt_count + 1 }),
            )
            .await;
        }
    }

    /// Append a lifecycle event for the job's document, if it has one with
    /// history. Never fails the job: a rejected transition is only logged.
    async fn record_transition(
        &self,
        job: &Job,
        event_type: InvoiceEventType,
        to: DocumentState,
        payload: JsonValue,
    ) {
        let Some(document_id) = job.related_document_id else {
            return;
        };
        match self.events.get_current_state(document_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(%document_id, "document has no history, skipping lifecycle event");
                return;
            }
            Err(err) => {
                error!(%document_id, error = %err, "failed to read document state");
                return;
            }
        }

        let request = NewInvoiceEvent::new(job.tenant_id, document_id, event_type, to)
            .payload(payload)
            .actor(self.config.name.clone(), ActorType::System)
            .correlation_id(job.id.to_string());

        match self.events.emit(request).await {
            Ok(event) => debug!(%document_id, event_type = %event.event_type, "document transitioned"),
            Err(err @ EventLogError::InvalidTransition { .. }) => {
                warn!(%document_id, job_id = %job.id, error = %err, "lifecycle transition rejected");
            }
            Err(err) => {
                error!(%document_id, job_id = %job.id, error = %err, "failed to record lifecycle event");
            }
        }
    }

    /// Run the poll loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, shutdown_rx, Arc::clone(&stats)));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop(
    worker: Worker,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %worker.config.name, service = %worker.config.service, "worker started");
    let started = Instant::now();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let full_batch = match worker.run_once().await {
            Ok(report) => {
                if report.claimed > 0 || report.stale_requeued > 0 {
                    info!(
                        worker = %worker.config.name,
                        claimed = report.claimed,
                        completed = report.completed,
                        retry_scheduled = report.retry_scheduled,
                        dead_lettered = report.dead_lettered,
                        deferred = report.deferred,
                        "batch processed"
                    );
                }
                let full = report.claimed as u64 >= u64::from(worker.config.batch_size);
                if let Ok(mut s) = stats.lock() {
                    s.absorb(&report);
                    s.uptime_secs = started.elapsed().as_secs();
                }
                full
            }
            Err(err) => {
                error!(worker = %worker.config.name, error = %err, "failed to claim jobs");
                if let Ok(mut s) = stats.lock() {
                    s.errors += 1;
                }
                false
            }
        };

        // A full batch suggests more work is waiting.
        if full_batch {
            continue;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(worker.config.poll_interval) => {}
        }
    }

    info!(worker = %worker.config.name, "worker stopped");
}
