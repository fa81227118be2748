//! Job scheduler: admission, idempotency, deduplication.
//!
//! Given "materialize process N", decide one of three outcomes and return
//! before any download begins: reuse the active job, reuse a complete result,
//! or admit a new job and enqueue its ticket. Concurrent admissions race on
//! the metadata store's active-job constraint; the loser reads the winner and
//! reports `ReusedActive`, so duplicate admission is impossible.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use docket_core::status::initial_document_status;
use docket_core::webhook::validate_webhook_url;
use docket_core::{Document, Job, JobStatus, Process, ProcessNumber};

use crate::blob_store::BlobStore;
use crate::broker::{Ticket, WorkBroker};
use crate::config::Config;
use crate::metadata_store::{MetadataStore, MetadataStoreError};
use crate::upstream::{ProcessMetadata, UpstreamClient, UpstreamError};

/// How an auto-download request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A new job was admitted and its ticket enqueued.
    Admitted,
    /// An active job already covers this process; nothing was enqueued.
    ReusedActive,
    /// Every document is already available; nothing was enqueued.
    ReusedComplete,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Admitted => "admitted",
            Decision::ReusedActive => "reused_active",
            Decision::ReusedComplete => "reused_complete",
        }
    }
}

/// A document together with a freshly signed read URL (when available).
#[derive(Debug, Clone)]
pub struct DocumentAccess {
    pub document: Document,
    pub download_url: Option<String>,
}

/// Scheduler outcome. `decision`/`job` are unset for metadata-only requests
/// (`auto_download=false`); `documents` is populated with re-signed URLs for
/// `ReusedComplete` so the caller gets usable links without another round
/// trip.
#[derive(Debug, Clone)]
pub struct Admission {
    pub process: Process,
    pub decision: Option<Decision>,
    pub job: Option<Job>,
    pub documents: Vec<DocumentAccess>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid webhook URL: {0}")]
    InvalidWebhook(String),

    #[error("upstream metadata unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),

    #[error(transparent)]
    Storage(#[from] MetadataStoreError),

    #[error("failed to enqueue job ticket: {0}")]
    Broker(String),
}

#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub process_number: ProcessNumber,
    pub webhook_url: Option<String>,
    pub auto_download: bool,
}

pub struct Scheduler {
    store: Arc<dyn MetadataStore>,
    upstream: Arc<dyn UpstreamClient>,
    broker: Arc<dyn WorkBroker>,
    blob_store: Arc<dyn BlobStore>,
    config: Arc<Config>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        upstream: Arc<dyn UpstreamClient>,
        broker: Arc<dyn WorkBroker>,
        blob_store: Arc<dyn BlobStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            upstream,
            broker,
            blob_store,
            config,
        }
    }

    /// Resolve a materialization request. Returns before any download begins.
    #[instrument(
        skip(self, request),
        fields(
            process_number = %request.process_number,
            auto_download = request.auto_download,
            has_webhook = request.webhook_url.is_some()
        ),
        err
    )]
    pub async fn materialize(
        &self,
        request: MaterializeRequest,
    ) -> Result<Admission, SchedulerError> {
        if let Some(url) = &request.webhook_url {
            validate_webhook_url(url, self.config.require_https_webhooks())
                .map_err(|e| SchedulerError::InvalidWebhook(e.to_string()))?;
        }

        let (process, fetched) = self.ensure_process(&request.process_number).await?;

        if !request.auto_download {
            return Ok(Admission {
                process,
                decision: None,
                job: None,
                documents: Vec::new(),
            });
        }

        // Outcome 1: an active job already covers this process.
        if let Some(active) = self.store.find_active_job(&request.process_number).await? {
            info!(job_id = %active.job_id, "reusing active job");
            return Ok(Admission {
                process,
                decision: Some(Decision::ReusedActive),
                job: Some(active),
                documents: Vec::new(),
            });
        }

        let documents = self.ensure_documents(&process, &request, fetched).await?;

        // Outcome 2: everything already available (vacuously so for a
        // process without documents).
        let all_available = documents
            .iter()
            .all(|d| d.status == docket_core::DocumentStatus::Available);
        if all_available {
            let documents = self.resign_documents(documents).await;
            info!(count = documents.len(), "process already complete");
            return Ok(Admission {
                process,
                decision: Some(Decision::ReusedComplete),
                job: None,
                documents,
            });
        }

        // Outcome 3: admit. The store's uniqueness constraint arbitrates
        // concurrent admissions.
        let mut job = Job::new(request.process_number.clone(), request.webhook_url.clone());
        job.total_documents = documents.len() as u32;

        match self.store.insert_job(&job).await {
            Ok(()) => {}
            Err(MetadataStoreError::ActiveJobExists { job_id, .. }) => {
                let winner = self
                    .store
                    .get_job(job_id)
                    .await?
                    .ok_or_else(|| MetadataStoreError::NotFound(format!("job {job_id}")))?;
                info!(job_id = %winner.job_id, "lost admission race, reusing winner");
                return Ok(Admission {
                    process,
                    decision: Some(Decision::ReusedActive),
                    job: Some(winner),
                    documents: Vec::new(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.broker.enqueue(Ticket { job_id: job.job_id }).await {
            // The job row exists but no worker will ever see it; fail it so
            // the active-job constraint does not wedge the process.
            warn!(job_id = %job.job_id, error = %e, "ticket enqueue failed");
            job.transition(JobStatus::Failed)
                .map_err(MetadataStoreError::from)?;
            job.error_message = Some(format!("ticket enqueue failed: {e}"));
            self.store.update_job(&job).await?;
            return Err(SchedulerError::Broker(e.to_string()));
        }

        info!(job_id = %job.job_id, total_documents = job.total_documents, "job admitted");
        Ok(Admission {
            process,
            decision: Some(Decision::Admitted),
            job: Some(job),
            documents: Vec::new(),
        })
    }

    /// Re-fetch upstream metadata for a known process, updating the stored
    /// summary and seeding any newly listed documents.
    #[instrument(skip(self), fields(process_number = %process_number), err)]
    pub async fn refresh(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Process>, SchedulerError> {
        let Some(mut process) = self.store.get_process(process_number).await? else {
            return Ok(None);
        };

        let metadata = self.upstream.fetch_process(process_number).await?;
        process.refresh(
            metadata.court.clone(),
            metadata.subject.clone(),
            metadata.summary.clone(),
            !metadata.documents.is_empty(),
        );
        self.store.upsert_process(&process).await?;

        // Refresh-seeded documents wait for the next admission.
        let seeded = self
            .store
            .seed_documents(&listing_to_documents(
                &metadata,
                docket_core::DocumentStatus::Pending,
            ))
            .await?;
        if seeded > 0 {
            info!(seeded, "seeded new documents during refresh");
        }
        Ok(Some(process))
    }

    /// Load or create the process record. Returns the upstream metadata too
    /// when a fetch was needed, so admission does not fetch twice.
    async fn ensure_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<(Process, Option<ProcessMetadata>), SchedulerError> {
        if let Some(process) = self.store.get_process(process_number).await? {
            return Ok((process, None));
        }

        let metadata = self.upstream.fetch_process(process_number).await?;
        let process = Process::new(
            process_number.clone(),
            metadata.court.clone(),
            metadata.subject.clone(),
            metadata.summary.clone(),
            !metadata.documents.is_empty(),
        );
        self.store.upsert_process(&process).await?;
        Ok((process, Some(metadata)))
    }

    /// Load the process's documents, seeding them from the upstream listing
    /// when none exist yet. Existing rows are left exactly as they are.
    async fn ensure_documents(
        &self,
        process: &Process,
        request: &MaterializeRequest,
        fetched: Option<ProcessMetadata>,
    ) -> Result<Vec<Document>, SchedulerError> {
        let existing = self.store.list_documents(&process.process_number).await?;
        if !existing.is_empty() || !process.has_documents {
            return Ok(existing);
        }

        let metadata = match fetched {
            Some(metadata) => metadata,
            None => {
                self.upstream
                    .fetch_process(&process.process_number)
                    .await?
            }
        };
        let seeded = listing_to_documents(
            &metadata,
            initial_document_status(request.webhook_url.is_some()),
        );
        self.store.seed_documents(&seeded).await?;
        Ok(self.store.list_documents(&process.process_number).await?)
    }

    async fn resign_documents(&self, documents: Vec<Document>) -> Vec<DocumentAccess> {
        let mut out = Vec::with_capacity(documents.len());
        for document in documents {
            let download_url = match &document.blob_key {
                Some(key) => match self
                    .blob_store
                    .presign_get(key, self.config.presign_ttl)
                    .await
                {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!(
                            document_id = %document.document_id,
                            error = %e,
                            "failed to re-sign document URL"
                        );
                        None
                    }
                },
                None => None,
            };
            out.push(DocumentAccess {
                document,
                download_url,
            });
        }
        out
    }
}

fn listing_to_documents(
    metadata: &ProcessMetadata,
    status: docket_core::DocumentStatus,
) -> Vec<Document> {
    metadata
        .documents
        .iter()
        .map(|listing| {
            Document::new(
                listing.document_id.clone(),
                metadata.process_number.clone(),
                listing.name.clone(),
                listing.mime_type.clone(),
                listing.source_handle.clone(),
                status,
            )
        })
        .collect()
}
