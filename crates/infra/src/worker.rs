//! Document worker: drives one job from claim to terminal commit.
//!
//! One ticket, one job. The claim is an atomic Pending -> Processing update
//! in the metadata store; a redelivered ticket finds the job already claimed
//! and is acknowledged without side effects, which is the entire reason
//! at-least-once broker semantics are acceptable.
//!
//! Documents are processed in batches of B: each batch runs concurrently,
//! batches are serial, and cancellation is polled between batches. Retry
//! lives here and in the webhook dispatcher only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use docket_core::model::blob_key;
use docket_core::{Document, DocumentStatus, DomainError, Job, JobStatus};

use crate::blob_store::BlobStore;
use crate::broker::{BrokerError, Delivery, WorkBroker};
use crate::config::Config;
use crate::metadata_store::{MetadataStore, MetadataStoreError};
use crate::retry::RetryPolicy;
use crate::upstream::UpstreamClient;
use crate::webhook::{WebhookDispatcher, WebhookDocument, WebhookPayload};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] MetadataStoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Outcome of one document's full attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentOutcome {
    Available,
    Failed,
    Skipped,
}

pub struct DocumentWorker {
    store: Arc<dyn MetadataStore>,
    blob_store: Arc<dyn BlobStore>,
    upstream: Arc<dyn UpstreamClient>,
    broker: Arc<dyn WorkBroker>,
    dispatcher: Arc<WebhookDispatcher>,
    config: Arc<Config>,
}

impl DocumentWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        upstream: Arc<dyn UpstreamClient>,
        broker: Arc<dyn WorkBroker>,
        dispatcher: Arc<WebhookDispatcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            blob_store,
            upstream,
            broker,
            dispatcher,
            config,
        }
    }

    /// Consume the broker until shutdown. A failed run logs and leaves the
    /// ticket unacknowledged; redelivery plus the claim guard handle the rest.
    pub async fn run_loop(&self, shutdown: Arc<AtomicBool>) {
        debug!("worker started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.broker.dequeue(Duration::from_millis(500)).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process_ticket(&delivery).await {
                        error!(
                            job_id = %delivery.ticket.job_id,
                            error = %e,
                            "job run aborted; ticket left unacknowledged"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "broker dequeue failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        debug!("worker stopped");
    }

    /// Drive the ticket's job to a terminal state.
    #[instrument(skip(self, delivery), fields(job_id = %delivery.ticket.job_id), err)]
    pub async fn process_ticket(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        // Claim guard: only a Pending job is ours to run.
        let Some(mut job) = self.store.claim_job(delivery.ticket.job_id).await? else {
            debug!("job missing or already claimed, acknowledging ticket");
            self.broker.ack(delivery).await?;
            return Ok(());
        };

        let documents = self.store.list_documents(&job.process_number).await?;
        job.total_documents = documents.len() as u32;
        let initial_completed = documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Available)
            .count() as u32;
        job.set_progress(initial_completed, 0)?;
        self.store.update_job(&job).await?;

        info!(
            total = job.total_documents,
            already_available = initial_completed,
            "job claimed"
        );

        let job_state = Arc::new(Mutex::new(job));
        let retry = RetryPolicy::exponential(
            self.config.document_attempts,
            self.config.document_backoff,
        );

        for batch in documents.chunks(self.config.batch_size.max(1)) {
            // Cooperative cancellation between batches: in-flight attempts
            // have already finished, nothing new is scheduled.
            let job_id = { job_state.lock().await.job_id };
            if let Some(current) = self.store.get_job(job_id).await? {
                if current.status == JobStatus::Cancelled {
                    info!("job cancelled, stopping between batches");
                    self.finish_cancelled(current).await?;
                    self.broker.ack(delivery).await?;
                    return Ok(());
                }
            }

            let runs = batch
                .iter()
                .map(|document| self.process_document(document.clone(), &job_state, &retry));
            for result in join_all(runs).await {
                result?;
            }
        }

        // Last cancellation check before the terminal commit; a cancel that
        // landed during the final batch still wins.
        let job_id = { job_state.lock().await.job_id };
        if let Some(current) = self.store.get_job(job_id).await? {
            if current.status == JobStatus::Cancelled {
                info!("job cancelled during final batch");
                self.finish_cancelled(current).await?;
                self.broker.ack(delivery).await?;
                return Ok(());
            }
        }

        let mut job = {
            let guard = job_state.lock().await;
            guard.clone()
        };
        let terminal = job.terminal_status();
        job.transition(terminal)?;
        self.store.update_job(&job).await?;
        info!(
            status = %job.status,
            completed = job.completed_documents,
            failed = job.failed_documents,
            "job finished"
        );

        if let Some(url) = job.webhook_url.clone() {
            self.send_webhook(&mut job, &url).await?;
        }

        self.broker.ack(delivery).await?;
        Ok(())
    }

    /// Process a single document through its attempt budget, committing the
    /// job counters after it settles. Returns `Err` only on metadata-store
    /// failures, which abort the whole run.
    async fn process_document(
        &self,
        mut document: Document,
        job_state: &Arc<Mutex<Job>>,
        retry: &RetryPolicy,
    ) -> Result<DocumentOutcome, WorkerError> {
        if document.status == DocumentStatus::Available {
            return Ok(DocumentOutcome::Skipped);
        }

        let mut last_error = String::new();
        for attempt in 1..=retry.max_attempts {
            self.begin_attempt(&mut document).await?;

            match self.attempt_transfer(&document).await {
                Ok((key, size, content_type)) => {
                    document.mark_available(key, size, content_type)?;
                    self.store.update_document(&document).await?;
                    self.commit_outcome(job_state, DocumentOutcome::Available)
                        .await?;
                    debug!(document_id = %document.document_id, attempt, "document available");
                    return Ok(DocumentOutcome::Available);
                }
                Err(message) => {
                    warn!(
                        document_id = %document.document_id,
                        attempt,
                        error = %message,
                        "document attempt failed"
                    );
                    last_error = message;
                    if retry.has_next(attempt) {
                        tokio::time::sleep(retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        let message = format!(
            "failed after {} attempts: {}",
            retry.max_attempts, last_error
        );
        if document.mark_failed(&message).is_err() {
            // Safety net: the state machine rejected the failure transition;
            // force Failed rather than strand the document.
            warn!(
                document_id = %document.document_id,
                status = %document.status,
                "forcing document failure despite illegal transition"
            );
            document.force_failed(&message)?;
        }
        self.store.update_document(&document).await?;
        self.commit_outcome(job_state, DocumentOutcome::Failed).await?;
        Ok(DocumentOutcome::Failed)
    }

    /// Enter Processing (Pending/Failed) or stamp the start of work for
    /// documents seeded directly into Processing.
    async fn begin_attempt(&self, document: &mut Document) -> Result<(), WorkerError> {
        match document.status {
            DocumentStatus::Pending | DocumentStatus::Failed => {
                document.transition(DocumentStatus::Processing)?;
                self.store.update_document(document).await?;
            }
            DocumentStatus::Processing if document.download_started_at.is_none() => {
                document.download_started_at = Some(chrono::Utc::now());
                document.updated_at = chrono::Utc::now();
                self.store.update_document(document).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// One fetch + upload attempt. Upstream and blob errors both collapse to
    /// a retryable message; only the caller's attempt budget bounds them.
    async fn attempt_transfer(
        &self,
        document: &Document,
    ) -> Result<(String, u64, Option<String>), String> {
        let payload = self
            .upstream
            .fetch_document(&document.source_handle)
            .await
            .map_err(|e| e.to_string())?;

        let key = blob_key(
            &document.process_number,
            &document.document_id,
            &document.name,
        );
        let content_type = payload
            .content_type
            .clone()
            .or_else(|| document.mime_type.clone());
        let size = payload.bytes.len() as u64;

        self.blob_store
            .put_object(&key, payload.bytes, content_type.as_deref())
            .await
            .map_err(|e| e.to_string())?;

        Ok((key, size, content_type))
    }

    /// Fold one settled document into the job counters and commit. The lock
    /// is held across the store write so counter commits stay ordered, and
    /// the write is counters-only so a concurrent cancellation on the job
    /// row is never clobbered.
    async fn commit_outcome(
        &self,
        job_state: &Arc<Mutex<Job>>,
        outcome: DocumentOutcome,
    ) -> Result<(), WorkerError> {
        let mut job = job_state.lock().await;
        let (completed, failed) = match outcome {
            DocumentOutcome::Available => (job.completed_documents + 1, job.failed_documents),
            DocumentOutcome::Failed => (job.completed_documents, job.failed_documents + 1),
            DocumentOutcome::Skipped => return Ok(()),
        };
        job.set_progress(completed, failed)?;
        self.store
            .update_job_progress(
                job.job_id,
                job.completed_documents,
                job.failed_documents,
                job.progress_percentage,
            )
            .await?;
        Ok(())
    }

    /// Cancelled between batches: no retries, no webhook, just close out.
    async fn finish_cancelled(&self, mut job: Job) -> Result<(), WorkerError> {
        if job.completed_at.is_none() {
            job.completed_at = Some(chrono::Utc::now());
        }
        self.store.update_job(&job).await?;
        Ok(())
    }

    async fn send_webhook(&self, job: &mut Job, url: &str) -> Result<(), WorkerError> {
        let payload = self.build_payload(job).await?;
        match self.dispatcher.deliver(url, &payload, job.job_id).await {
            Ok(report) => {
                job.record_webhook_outcome(
                    report.success,
                    report.attempts,
                    report.last_error,
                    report.sent_at,
                )?;
            }
            Err(policy_error) => {
                // The URL fails policy at send time; record and move on. The
                // job's terminal status is never affected by delivery.
                warn!(error = %policy_error, "webhook rejected by URL policy");
                job.record_webhook_outcome(false, 0, Some(policy_error.to_string()), None)?;
            }
        }
        self.store.update_job(job).await?;
        Ok(())
    }

    async fn build_payload(&self, job: &Job) -> Result<WebhookPayload, WorkerError> {
        let documents = self.store.list_documents(&job.process_number).await?;
        let mut entries = Vec::with_capacity(documents.len());
        for document in documents {
            let download_url = match (&document.status, &document.blob_key) {
                (DocumentStatus::Available, Some(key)) => {
                    match self
                        .blob_store
                        .presign_get(key, self.config.presign_ttl)
                        .await
                    {
                        Ok(url) => Some(url),
                        Err(e) => {
                            warn!(
                                document_id = %document.document_id,
                                error = %e,
                                "failed to sign document URL for webhook payload"
                            );
                            None
                        }
                    }
                }
                _ => None,
            };
            entries.push(WebhookDocument {
                id: document.document_id.to_string(),
                uuid: document.external_uuid(),
                name: document.name.clone(),
                mime_type: document.mime_type.clone(),
                size: document.size,
                status: document.status,
                download_url,
                error_message: document.error_message.clone(),
            });
        }

        Ok(WebhookPayload {
            process_number: job.process_number.to_string(),
            job_id: job.job_id,
            status: job.status,
            total_documents: job.total_documents,
            completed_documents: job.completed_documents,
            failed_documents: job.failed_documents,
            completed_at: job.completed_at,
            documents: entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::broker::{InMemoryBroker, Ticket};
    use crate::metadata_store::InMemoryMetadataStore;
    use crate::upstream::{
        DocumentPayload, InMemoryUpstreamClient, ProcessMetadata, UpstreamClient, UpstreamError,
    };
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use docket_core::{DocumentId, JobId, Process, ProcessNumber};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn number(n: &str) -> ProcessNumber {
        ProcessNumber::new(n).unwrap()
    }

    fn test_config() -> Config {
        Config {
            batch_size: 2,
            document_attempts: 3,
            document_backoff: Duration::from_millis(5),
            webhook_attempts: 3,
            webhook_backoff: Duration::from_millis(5),
            webhook_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        blob_store: Arc<InMemoryBlobStore>,
        upstream: Arc<InMemoryUpstreamClient>,
        broker: Arc<InMemoryBroker>,
        worker: DocumentWorker,
    }

    fn fixture_with_upstream(upstream: Arc<dyn UpstreamClient>) -> (
        Arc<InMemoryMetadataStore>,
        Arc<InMemoryBlobStore>,
        Arc<InMemoryBroker>,
        DocumentWorker,
    ) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let blob_store = Arc::new(InMemoryBlobStore::new());
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(60)));
        let config = Arc::new(test_config());
        let dispatcher = Arc::new(
            WebhookDispatcher::new(
                config.webhook_attempts,
                config.webhook_backoff,
                config.webhook_timeout,
                config.require_https_webhooks(),
            )
            .unwrap(),
        );
        let worker = DocumentWorker::new(
            store.clone(),
            blob_store.clone(),
            upstream,
            broker.clone(),
            dispatcher,
            config,
        );
        (store, blob_store, broker, worker)
    }

    fn fixture() -> Fixture {
        let upstream = Arc::new(InMemoryUpstreamClient::new());
        let (store, blob_store, broker, worker) =
            fixture_with_upstream(upstream.clone() as Arc<dyn UpstreamClient>);
        Fixture {
            store,
            blob_store,
            upstream,
            broker,
            worker,
        }
    }

    /// Seed a process with `docs` pending documents and a pending job.
    async fn seed(f: &Fixture, n: &str, docs: usize, webhook_url: Option<String>) -> Job {
        let process = Process::new(number(n), None, None, json!({}), docs > 0);
        f.store.upsert_process(&process).await.unwrap();

        let documents: Vec<Document> = (0..docs)
            .map(|i| {
                Document::new(
                    DocumentId::new(format!("d-{i}")).unwrap(),
                    number(n),
                    format!("d-{i}.pdf"),
                    Some("application/pdf".to_string()),
                    format!("handle-{n}-{i}"),
                    DocumentStatus::Pending,
                )
            })
            .collect();
        f.store.seed_documents(&documents).await.unwrap();

        for i in 0..docs {
            f.upstream.register_document(
                format!("handle-{n}-{i}"),
                DocumentPayload {
                    bytes: vec![0xD0; 16],
                    content_type: Some("application/pdf".to_string()),
                },
            );
        }

        let mut job = Job::new(number(n), webhook_url);
        job.total_documents = docs as u32;
        f.store.insert_job(&job).await.unwrap();
        job
    }

    fn delivery(job_id: JobId) -> Delivery {
        Delivery {
            ticket: Ticket { job_id },
            receipt: "r-1".to_string(),
            attempt: 1,
        }
    }

    async fn spawn_receiver(
        status: StatusCode,
    ) -> (String, Arc<AtomicU32>, Arc<std::sync::Mutex<Vec<serde_json::Value>>>) {
        let hits = Arc::new(AtomicU32::new(0));
        let bodies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hits_in = hits.clone();
        let bodies_in = bodies.clone();
        let app = Router::new().route(
            "/cb",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let hits = hits_in.clone();
                let bodies = bodies_in.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    bodies.lock().unwrap().push(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/cb"), hits, bodies)
    }

    #[tokio::test]
    async fn happy_path_with_webhook() {
        let f = fixture();
        let (url, hits, bodies) = spawn_receiver(StatusCode::OK).await;
        let job = seed(&f, "p-1", 3, Some(url)).await;

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.completed_documents, 3);
        assert_eq!(finished.failed_documents, 0);
        assert!((finished.progress_percentage - 100.0).abs() < f64::EPSILON);
        assert!(finished.webhook_sent);
        assert_eq!(finished.webhook_attempts, 1);
        assert!(finished.webhook_sent_at.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let docs = f.store.list_documents(&number("p-1")).await.unwrap();
        assert!(docs.iter().all(|d| d.status == DocumentStatus::Available));
        assert!(docs.iter().all(|d| d.blob_key.is_some()
            && d.size == Some(16)
            && d.download_completed_at.is_some()));
        // Bytes actually landed in the blob store under the expected keys.
        for doc in &docs {
            assert_eq!(
                f.blob_store.object_size(doc.blob_key.as_deref().unwrap()),
                Some(16)
            );
        }

        // Every payload entry carries a download URL.
        let body = bodies.lock().unwrap().pop().unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["documents"].as_array().unwrap().len(), 3);
        for doc in body["documents"].as_array().unwrap() {
            assert_eq!(doc["status"], "available");
            assert!(doc["download_url"].as_str().unwrap().contains("expires="));
        }

        // Ticket acknowledged.
        assert_eq!(f.broker.depth(), 0);
    }

    #[tokio::test]
    async fn partial_failure_marks_job_failed() {
        let f = fixture();
        let (url, _hits, bodies) = spawn_receiver(StatusCode::OK).await;
        let job = seed(&f, "p-2", 4, Some(url)).await;
        // Document #2 fails persistently with a 500.
        f.upstream.fail_document(
            "handle-p-2-2",
            UpstreamError::Status { code: 500 },
            None,
        );

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.completed_documents, 3);
        assert_eq!(finished.failed_documents, 1);

        let failed = f
            .store
            .get_document(&number("p-2"), &DocumentId::new("d-2").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("failed after 3 attempts"));

        // Retry budget honored exactly.
        assert_eq!(f.upstream.fetch_count("handle-p-2-2"), 3);

        // Webhook still fired, reporting the failure.
        let body = bodies.lock().unwrap().pop().unwrap();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["failed_documents"], 1);
        let doc = body["documents"]
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["id"] == "d-2")
            .unwrap()
            .clone();
        assert_eq!(doc["status"], "failed");
        assert!(doc.get("download_url").is_none());
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let f = fixture();
        let job = seed(&f, "p-3", 1, None).await;
        f.upstream
            .fail_document("handle-p-3-0", UpstreamError::Timeout, Some(2));

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(f.upstream.fetch_count("handle-p-3-0"), 3);
    }

    #[tokio::test]
    async fn redelivered_ticket_is_acknowledged_without_effect() {
        let f = fixture();
        let job = seed(&f, "p-4", 1, None).await;

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();
        let after_first = f.store.get_job(job.job_id).await.unwrap().unwrap();

        // Broker redelivers; the claim guard refuses and the ticket is acked.
        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();
        let after_second = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(f.upstream.fetch_count("handle-p-4-0"), 1);
    }

    #[tokio::test]
    async fn unknown_job_ticket_is_dropped() {
        let f = fixture();
        f.worker.process_ticket(&delivery(JobId::new())).await.unwrap();
    }

    #[tokio::test]
    async fn already_available_documents_are_skipped_and_counted() {
        let f = fixture();
        let job = seed(&f, "p-5", 2, None).await;

        // First document is already available from a previous run.
        let mut done = f
            .store
            .get_document(&number("p-5"), &DocumentId::new("d-0").unwrap())
            .await
            .unwrap()
            .unwrap();
        done.transition(DocumentStatus::Processing).unwrap();
        done.mark_available("processes/p-5/documents/d-0/d-0.pdf", 16, None)
            .unwrap();
        f.store.update_document(&done).await.unwrap();

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.completed_documents, 2);
        // The settled document was never fetched again.
        assert_eq!(f.upstream.fetch_count("handle-p-5-0"), 0);
        assert_eq!(f.upstream.fetch_count("handle-p-5-1"), 1);
    }

    #[tokio::test]
    async fn webhook_exhaustion_leaves_job_completed() {
        let f = fixture();
        let (url, hits, _bodies) = spawn_receiver(StatusCode::SERVICE_UNAVAILABLE).await;
        let job = seed(&f, "p-6", 1, Some(url)).await;

        f.worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(!finished.webhook_sent);
        assert_eq!(finished.webhook_attempts, 3);
        assert!(finished
            .webhook_last_error
            .as_deref()
            .unwrap()
            .contains("503"));
        assert!(finished.webhook_sent_at.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let docs = f.store.list_documents(&number("p-6")).await.unwrap();
        assert!(docs.iter().all(|d| d.status == DocumentStatus::Available));
    }

    /// Upstream that cancels the job on its first fetch, so the cancellation
    /// lands while batch one is in flight.
    struct CancellingUpstream {
        store: Arc<InMemoryMetadataStore>,
        job_id: std::sync::Mutex<Option<JobId>>,
    }

    #[async_trait]
    impl UpstreamClient for CancellingUpstream {
        async fn fetch_process(
            &self,
            _process_number: &ProcessNumber,
        ) -> Result<ProcessMetadata, UpstreamError> {
            Err(UpstreamError::Status { code: 404 })
        }

        async fn fetch_document(
            &self,
            _source_handle: &str,
        ) -> Result<DocumentPayload, UpstreamError> {
            let job_id = self.job_id.lock().unwrap().expect("job id set");
            let mut job = self.store.get_job(job_id).await.unwrap().unwrap();
            if job.status == JobStatus::Processing {
                job.transition(JobStatus::Cancelled).unwrap();
                self.store.update_job(&job).await.unwrap();
            }
            Ok(DocumentPayload {
                bytes: vec![1, 2, 3],
                content_type: None,
            })
        }
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let upstream = Arc::new(CancellingUpstream {
            store: store.clone(),
            job_id: std::sync::Mutex::new(None),
        });
        let blob_store = Arc::new(InMemoryBlobStore::new());
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(60)));
        let config = Arc::new(Config {
            batch_size: 1,
            ..test_config()
        });
        let dispatcher = Arc::new(
            WebhookDispatcher::new(3, Duration::from_millis(5), Duration::from_secs(2), false)
                .unwrap(),
        );
        let worker = DocumentWorker::new(
            store.clone(),
            blob_store,
            upstream.clone(),
            broker,
            dispatcher,
            config,
        );

        let n = number("p-7");
        store
            .upsert_process(&Process::new(n.clone(), None, None, json!({}), true))
            .await
            .unwrap();
        let documents: Vec<Document> = (0..2)
            .map(|i| {
                Document::new(
                    DocumentId::new(format!("d-{i}")).unwrap(),
                    n.clone(),
                    format!("d-{i}.pdf"),
                    None,
                    format!("handle-{i}"),
                    DocumentStatus::Pending,
                )
            })
            .collect();
        store.seed_documents(&documents).await.unwrap();

        let job = Job::new(n.clone(), Some("https://example.test/cb".to_string()));
        store.insert_job(&job).await.unwrap();
        *upstream.job_id.lock().unwrap() = Some(job.job_id);

        worker.process_ticket(&delivery(job.job_id)).await.unwrap();

        let finished = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(finished.completed_at.is_some());
        // No webhook on cancellation.
        assert!(!finished.webhook_sent);
        assert_eq!(finished.webhook_attempts, 0);

        // Batch one finished its in-flight attempt; batch two never started.
        let docs = store.list_documents(&n).await.unwrap();
        assert_eq!(docs[0].status, DocumentStatus::Available);
        assert_eq!(docs[1].status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn run_loop_consumes_until_shutdown() {
        let f = fixture();
        let job = seed(&f, "p-8", 1, None).await;
        f.broker
            .enqueue(Ticket { job_id: job.job_id })
            .await
            .unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(f.worker);
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run_loop(shutdown).await })
        };

        // Wait for the job to finish, then stop the loop.
        for _ in 0..100 {
            let job = f.store.get_job(job.job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        let finished = f.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(f.broker.depth(), 0);
    }
}
