//! End-to-end tests for the submission pipeline.
//!
//! Enqueue → Worker (CircuitBreaker → Submitter) → JobQueue + EventLog
//!
//! Verifies:
//! - Successful submissions complete the job and accept the document
//! - Failures retry with backoff, then dead-letter and reject the document
//! - An open circuit defers jobs without spending attempts
//! - Concurrent workers never submit the same job twice
//!
//! The `postgres_*` tests need `DATABASE_URL` and run with `--ignored`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use taxbridge_core::{DocumentId, JobId, TenantId};
use taxbridge_documents::{DocumentState, InvoiceEventType};

use crate::circuit::CircuitState;
use crate::config::TaxbridgeConfig;
use crate::event_log::NewInvoiceEvent;
use crate::jobs::{
    BackoffPolicy, DeadLetterFilter, DeadLetterStatus, ErrorCategory, Job, JobStatus, JobType,
    NewJob,
};
use crate::pagination::Pagination;
use crate::services::Services;
use crate::worker::{SubmissionError, Submitter};

fn test_config() -> TaxbridgeConfig {
    let mut config = TaxbridgeConfig::default();
    config.queue.backoff = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5));
    config.queue.default_max_attempts = 3;
    config.queue.jitter_seed = Some(11);
    config.circuit.failure_threshold = 5;
    config.circuit.timeout = Duration::from_secs(60);
    config.worker.batch_size = 10;
    config.worker.poll_interval = Duration::from_millis(10);
    config
}

fn accepting() -> Arc<dyn Submitter> {
    Arc::new(|job: Job| async move {
        Ok::<_, SubmissionError>(json!({ "protocol": format!("P-{}", job.id) }))
    })
}

fn failing(message: &'static str, calls: Arc<AtomicUsize>) -> Arc<dyn Submitter> {
    Arc::new(move |_job: Job| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<JsonValue, _>(SubmissionError::new(message))
        }
    })
}

/// Draft → Validated → Queued, then enqueue a submission for it.
async fn queued_document(services: &Services, tenant: TenantId) -> (DocumentId, JobId) {
    let doc = DocumentId::new();
    for (event_type, state) in [
        (InvoiceEventType::DocumentCreated, DocumentState::Draft),
        (InvoiceEventType::DocumentValidated, DocumentState::Validated),
        (InvoiceEventType::SubmissionQueued, DocumentState::Queued),
    ] {
        services
            .event_log
            .emit(NewInvoiceEvent::new(tenant, doc, event_type, state))
            .await
            .unwrap();
    }

    let job_id = services
        .queue
        .enqueue(
            NewJob::new(tenant, JobType::SubmitDocument, json!({ "documentId": doc }))
                .idempotency_key(format!("submit-{doc}"))
                .related_document(doc),
        )
        .await
        .unwrap();
    (doc, job_id)
}

async fn state_of(services: &Services, doc: DocumentId) -> Option<DocumentState> {
    services.event_log.get_current_state(doc).await.unwrap()
}

#[tokio::test]
async fn accepted_submission_completes_job_and_document() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let (doc, job_id) = queued_document(&services, tenant).await;

    let report = services.worker(accepting()).run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Accepted));

    let history = services
        .event_log
        .get_history(doc, Pagination::default())
        .await
        .unwrap();
    let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            InvoiceEventType::DocumentCreated,
            InvoiceEventType::DocumentValidated,
            InvoiceEventType::SubmissionQueued,
            InvoiceEventType::SubmissionStarted,
            InvoiceEventType::SubmissionAccepted,
        ]
    );
    assert_eq!(history[4].correlation_id.as_deref(), Some(job_id.to_string().as_str()));

    let lifecycle = services.event_log.rebuild_state(doc).await.unwrap();
    assert!(lifecycle.consistent);
    assert_eq!(lifecycle.current_state, Some(DocumentState::Accepted));
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let (doc, job_id) = queued_document(&services, tenant).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let report = services
        .worker(failing("connection reset by peer", Arc::clone(&calls)))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.retry_scheduled, 1);

    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert!(job.next_retry_at.is_some());
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Submitted));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = services.worker(accepting()).run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Accepted));

    // SUBMITTED is recorded once, not per attempt.
    let started = services
        .event_log
        .get_history(doc, Pagination::default())
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == InvoiceEventType::SubmissionStarted)
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_reject_document() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let (doc, job_id) = queued_document(&services, tenant).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = services.worker(failing("rejected by authority: duplicate key", Arc::clone(&calls)));
    let mut dead_lettered = 0;
    for _ in 0..3 {
        dead_lettered += worker.run_once().await.unwrap().dead_lettered;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(dead_lettered, 1);

    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dlq);

    let entries = services
        .queue
        .list_dead_letters(DeadLetterFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(entries.total, 1);
    let entry = &entries.items[0];
    assert_eq!(entry.failure_count, 3);
    assert_eq!(entry.error_category, ErrorCategory::RemoteReject);

    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Rejected));
    let history = services
        .event_log
        .get_history(doc, Pagination::default())
        .await
        .unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.event_type, InvoiceEventType::SubmissionFailed);
    assert_eq!(last.payload["errorCategory"], json!("REMOTE_REJECT"));

    // Manual replay resubmits the document through a fresh job.
    let replayed = services.queue.retry_from_dlq(entry.id).await.unwrap();
    assert_ne!(replayed, job_id);
    let report = services.worker(accepting()).run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Accepted));

    let entry = services.queue.get_dead_letter(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Resolved);
    let original = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Dlq);

    let lifecycle = services.event_log.rebuild_state(doc).await.unwrap();
    assert!(lifecycle.consistent);
}

#[tokio::test]
async fn open_circuit_defers_without_spending_attempts() {
    let mut config = test_config();
    config.circuit.failure_threshold = 1;
    let services = Services::in_memory(config).unwrap();
    let tenant = TenantId::new();
    let (_, first) = queued_document(&services, tenant).await;
    let (second_doc, second) = queued_document(&services, tenant).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let report = services
        .worker(failing("network unreachable", Arc::clone(&calls)))
        .run_once()
        .await
        .unwrap();

    // The first failure opens the circuit; the second job never reaches the
    // authority.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.retry_scheduled, 1);
    assert_eq!(report.deferred, 1);

    let status = services.breaker.get_status("tax-authority").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);

    let deferred_id = if services.queue.get_job(first).await.unwrap().unwrap().attempt_count == 0 {
        first
    } else {
        second
    };
    let deferred = services.queue.get_job(deferred_id).await.unwrap().unwrap();
    assert_eq!(deferred.status, JobStatus::Pending);
    assert_eq!(deferred.attempt_count, 0);
    assert!(deferred.next_retry_at.is_some_and(|at| at > chrono::Utc::now()));

    if deferred_id == second {
        assert_eq!(state_of(&services, second_doc).await, Some(DocumentState::Queued));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_submit_each_job_once() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    for _ in 0..20 {
        queued_document(&services, tenant).await;
    }

    let seen: Arc<Mutex<HashMap<JobId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let submitter: Arc<dyn Submitter> = {
        let seen = Arc::clone(&seen);
        Arc::new(move |job: Job| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap().entry(job.id).or_default() += 1;
                tokio::task::yield_now().await;
                Ok::<_, SubmissionError>(json!({}))
            }
        })
    };

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let worker = services.worker(Arc::clone(&submitter));
        tasks.push(tokio::spawn(async move {
            let mut completed = 0;
            for _ in 0..3 {
                completed += worker.run_once().await.unwrap().completed;
            }
            completed
        }));
    }
    let mut completed = 0;
    for task in tasks {
        completed += task.await.unwrap();
    }

    assert_eq!(completed, 20);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    assert!(seen.values().all(|&n| n == 1));

    let stats = services.queue.stats(Some(tenant)).await.unwrap();
    assert_eq!(stats.completed, 20);
}

#[tokio::test]
async fn spawned_worker_drains_queue_and_shuts_down() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let (doc, job_id) = queued_document(&services, tenant).await;

    let handle = services.worker(accepting()).spawn();

    let mut accepted = false;
    for _ in 0..200 {
        if state_of(&services, doc).await == Some(DocumentState::Accepted) {
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(accepted, "worker did not submit the document");
    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let stats = handle.shutdown().await;
    assert!(stats.jobs_completed >= 1);
    assert!(stats.batches >= 1);
}

#[tokio::test]
async fn shutdown_after_a_panicking_submitter_returns() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let (_, job_id) = queued_document(&services, tenant).await;

    let panicking: Arc<dyn Submitter> = Arc::new(|_job: Job| async move {
        if true {
            panic!("submitter exploded");
        }
        Ok::<_, SubmissionError>(json!({}))
    });
    let handle = services.worker(panicking).spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown hung after the worker loop died");
    assert_eq!(stats.jobs_completed, 0);

    // The claim is left for the stale sweep.
    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn abandoned_job_is_swept_back_into_the_queue() {
    let mut config = test_config();
    config.worker.stale_after = Duration::ZERO;
    let services = Services::in_memory(config).unwrap();
    let tenant = TenantId::new();
    let (_, job_id) = queued_document(&services, tenant).await;

    // Claimed by a worker that then disappeared.
    let claimed = services.queue.dequeue(1, None).await.unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = services.worker(accepting()).run_once().await.unwrap();
    assert_eq!(report.stale_requeued, 1);

    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error.as_deref(), Some(crate::jobs::LEASE_EXPIRED));
}

#[tokio::test]
async fn idempotent_enqueue_through_services() {
    let services = Services::in_memory(test_config()).unwrap();
    let tenant = TenantId::new();
    let request = NewJob::new(tenant, JobType::SubmitDocument, json!({})).idempotency_key("inv-42");

    let a = services.queue.enqueue(request.clone()).await.unwrap();
    let b = services.queue.enqueue(request).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(services.queue.stats(Some(tenant)).await.unwrap().total, 1);
}

async fn postgres_services() -> Services {
    let mut config = test_config();
    config.database_url =
        Some(std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests"));
    Services::connect(config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_pipeline_round_trip() {
    let services = postgres_services().await;
    let tenant = TenantId::new();
    let (doc, job_id) = queued_document(&services, tenant).await;

    let calls = Arc::new(AtomicUsize::new(0));
    services
        .worker(failing("request timed out", Arc::clone(&calls)))
        .run_once()
        .await
        .unwrap();
    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 1);
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Submitted));

    tokio::time::sleep(Duration::from_millis(20)).await;
    services.worker(accepting()).run_once().await.unwrap();
    let job = services.queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Accepted));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_rejects_invalid_transition_without_writing() {
    let services = postgres_services().await;
    let tenant = TenantId::new();
    let doc = DocumentId::new();
    services
        .event_log
        .emit(NewInvoiceEvent::new(tenant, doc, InvoiceEventType::DocumentCreated, DocumentState::Draft))
        .await
        .unwrap();

    let err = services
        .event_log
        .emit(NewInvoiceEvent::new(
            tenant,
            doc,
            InvoiceEventType::SubmissionStarted,
            DocumentState::Submitted,
        ))
        .await;
    assert!(err.is_err());
    assert_eq!(state_of(&services, doc).await, Some(DocumentState::Draft));
    assert_eq!(
        services
            .event_log
            .get_history(doc, Pagination::default())
            .await
            .unwrap()
            .len(),
        1
    );
}
