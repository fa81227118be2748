//! Read-only status projection.
//!
//! Assembles the `ProcessStatus` a poller sees from the metadata store, and
//! re-signs a fresh read URL for every available document on every call.
//! Performs no writes and no upstream calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{instrument, warn};

use docket_core::{DocumentStatus, JobId, JobStatus, ProcessNumber};

use crate::blob_store::BlobStore;
use crate::metadata_store::{MetadataStore, MetadataStoreError};

/// Overall state of a process as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-document record of the status projection.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusView {
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_completed_at: Option<DateTime<Utc>>,
}

/// The full poller-facing projection.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub process_number: String,
    pub overall_status: OverallStatus,
    pub progress_percentage: f64,
    pub total_documents: u32,
    pub pending_documents: u32,
    pub processing_documents: u32,
    pub completed_documents: u32,
    pub failed_documents: u32,
    pub documents: Vec<DocumentStatusView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub webhook_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct StatusProjection {
    store: Arc<dyn MetadataStore>,
    blob_store: Arc<dyn BlobStore>,
    presign_ttl: std::time::Duration,
}

impl StatusProjection {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        presign_ttl: std::time::Duration,
    ) -> Self {
        Self {
            store,
            blob_store,
            presign_ttl,
        }
    }

    /// Compose the projection for one process, or `None` if it is unknown.
    #[instrument(skip(self), fields(process_number = %process_number), err)]
    pub async fn process_status(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<ProcessStatus>, MetadataStoreError> {
        if self.store.get_process(process_number).await?.is_none() {
            return Ok(None);
        }

        let documents = self.store.list_documents(process_number).await?;
        let latest_job = self.store.find_latest_job(process_number).await?;

        let total = documents.len() as u32;
        let mut pending = 0u32;
        let mut processing = 0u32;
        let mut completed = 0u32;
        let mut failed = 0u32;
        for document in &documents {
            match document.status {
                DocumentStatus::Pending => pending += 1,
                DocumentStatus::Processing => processing += 1,
                DocumentStatus::Available => completed += 1,
                DocumentStatus::Failed => failed += 1,
            }
        }

        let overall_status = if total > 0 && completed == total {
            OverallStatus::Completed
        } else if total > 0 && failed == total {
            OverallStatus::Failed
        } else if processing > 0
            || latest_job
                .as_ref()
                .is_some_and(|j| j.status == JobStatus::Processing)
        {
            OverallStatus::Processing
        } else {
            OverallStatus::Pending
        };

        let progress_percentage =
            100.0 * f64::from(completed + failed) / f64::from(total.max(1));

        let mut views = Vec::with_capacity(documents.len());
        for document in documents {
            let download_url = match (&document.status, &document.blob_key) {
                (DocumentStatus::Available, Some(key)) => {
                    match self.blob_store.presign_get(key, self.presign_ttl).await {
                        Ok(url) => Some(url),
                        Err(e) => {
                            warn!(
                                document_id = %document.document_id,
                                error = %e,
                                "failed to re-sign document URL"
                            );
                            None
                        }
                    }
                }
                _ => None,
            };
            views.push(DocumentStatusView {
                id: document.document_id.to_string(),
                uuid: document.external_uuid(),
                name: document.name.clone(),
                status: document.status,
                mime_type: document.mime_type.clone(),
                size: document.size,
                download_url,
                error_message: document.error_message.clone(),
                download_started_at: document.download_started_at,
                download_completed_at: document.download_completed_at,
            });
        }

        Ok(Some(ProcessStatus {
            process_number: process_number.to_string(),
            overall_status,
            progress_percentage,
            total_documents: total,
            pending_documents: pending,
            processing_documents: processing,
            completed_documents: completed,
            failed_documents: failed,
            documents: views,
            job_id: latest_job.as_ref().map(|j| j.job_id),
            webhook_url: latest_job.as_ref().and_then(|j| j.webhook_url.clone()),
            webhook_sent: latest_job.as_ref().is_some_and(|j| j.webhook_sent),
            webhook_sent_at: latest_job.as_ref().and_then(|j| j.webhook_sent_at),
            created_at: latest_job.as_ref().map(|j| j.created_at),
            started_at: latest_job.as_ref().and_then(|j| j.started_at),
            completed_at: latest_job.as_ref().and_then(|j| j.completed_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::metadata_store::InMemoryMetadataStore;
    use docket_core::{Document, DocumentId, Job, Process};
    use serde_json::json;
    use std::time::Duration;

    fn number(n: &str) -> ProcessNumber {
        ProcessNumber::new(n).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        blob_store: Arc<InMemoryBlobStore>,
        projection: StatusProjection,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMetadataStore::new());
        let blob_store = Arc::new(InMemoryBlobStore::new());
        let projection = StatusProjection::new(
            store.clone(),
            blob_store.clone(),
            Duration::from_secs(3600),
        );
        Fixture {
            store,
            blob_store,
            projection,
        }
    }

    async fn seed_process(f: &Fixture, n: &str) {
        f.store
            .upsert_process(&Process::new(number(n), None, None, json!({}), true))
            .await
            .unwrap();
    }

    async fn seed_document(f: &Fixture, n: &str, id: &str, status: DocumentStatus) -> Document {
        let mut doc = Document::new(
            DocumentId::new(id).unwrap(),
            number(n),
            format!("{id}.pdf"),
            Some("application/pdf".to_string()),
            format!("handle-{id}"),
            DocumentStatus::Pending,
        );
        match status {
            DocumentStatus::Pending => {}
            DocumentStatus::Processing => {
                doc.transition(DocumentStatus::Processing).unwrap();
            }
            DocumentStatus::Available => {
                doc.transition(DocumentStatus::Processing).unwrap();
                let key = format!("processes/{n}/documents/{id}/{id}.pdf");
                f.blob_store
                    .put_object(&key, vec![0xAB; 8], Some("application/pdf"))
                    .await
                    .unwrap();
                doc.mark_available(key, 8, None).unwrap();
            }
            DocumentStatus::Failed => {
                doc.mark_failed("failed after 3 attempts: HTTP 500").unwrap();
            }
        }
        f.store.seed_documents(std::slice::from_ref(&doc)).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn unknown_process_is_none() {
        let f = fixture();
        assert!(f
            .projection
            .process_status(&number("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn counts_and_progress() {
        let f = fixture();
        seed_process(&f, "p-1").await;
        seed_document(&f, "p-1", "d-0", DocumentStatus::Available).await;
        seed_document(&f, "p-1", "d-1", DocumentStatus::Failed).await;
        seed_document(&f, "p-1", "d-2", DocumentStatus::Processing).await;
        seed_document(&f, "p-1", "d-3", DocumentStatus::Pending).await;

        let status = f
            .projection
            .process_status(&number("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.total_documents, 4);
        assert_eq!(status.completed_documents, 1);
        assert_eq!(status.failed_documents, 1);
        assert_eq!(status.processing_documents, 1);
        assert_eq!(status.pending_documents, 1);
        assert_eq!(status.overall_status, OverallStatus::Processing);
        assert!((status.progress_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn completed_only_when_every_document_is_available() {
        let f = fixture();
        seed_process(&f, "p-2").await;
        seed_document(&f, "p-2", "d-0", DocumentStatus::Available).await;
        seed_document(&f, "p-2", "d-1", DocumentStatus::Available).await;

        let status = f
            .projection
            .process_status(&number("p-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.overall_status, OverallStatus::Completed);
        assert!((status.progress_percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_only_when_every_document_failed() {
        let f = fixture();
        seed_process(&f, "p-3").await;
        seed_document(&f, "p-3", "d-0", DocumentStatus::Failed).await;
        seed_document(&f, "p-3", "d-1", DocumentStatus::Failed).await;

        let status = f
            .projection
            .process_status(&number("p-3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.overall_status, OverallStatus::Failed);
    }

    #[tokio::test]
    async fn empty_process_is_pending_with_zero_progress() {
        let f = fixture();
        seed_process(&f, "p-4").await;

        let status = f
            .projection
            .process_status(&number("p-4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.overall_status, OverallStatus::Pending);
        assert_eq!(status.progress_percentage, 0.0);
        assert!(status.job_id.is_none());
    }

    #[tokio::test]
    async fn available_documents_get_fresh_urls_every_read() {
        let f = fixture();
        seed_process(&f, "p-5").await;
        seed_document(&f, "p-5", "d-0", DocumentStatus::Available).await;

        let first = f
            .projection
            .process_status(&number("p-5"))
            .await
            .unwrap()
            .unwrap();
        let second = f
            .projection
            .process_status(&number("p-5"))
            .await
            .unwrap()
            .unwrap();

        let a = first.documents[0].download_url.as_deref().unwrap();
        let b = second.documents[0].download_url.as_deref().unwrap();
        assert_ne!(a, b, "URLs must be re-signed, never cached");
    }

    #[tokio::test]
    async fn failed_documents_expose_error_not_url() {
        let f = fixture();
        seed_process(&f, "p-6").await;
        seed_document(&f, "p-6", "d-0", DocumentStatus::Failed).await;

        let status = f
            .projection
            .process_status(&number("p-6"))
            .await
            .unwrap()
            .unwrap();
        let doc = &status.documents[0];
        assert!(doc.download_url.is_none());
        assert!(doc.error_message.as_deref().unwrap().contains("HTTP 500"));

        let json = serde_json::to_value(&status).unwrap();
        assert!(json["documents"][0].get("download_url").is_none());
    }

    #[tokio::test]
    async fn latest_job_fields_are_projected() {
        let f = fixture();
        seed_process(&f, "p-7").await;
        seed_document(&f, "p-7", "d-0", DocumentStatus::Available).await;

        let mut job = Job::new(
            number("p-7"),
            Some("https://example.test/cb".to_string()),
        );
        job.total_documents = 1;
        f.store.insert_job(&job).await.unwrap();
        job.transition(JobStatus::Processing).unwrap();
        job.set_progress(1, 0).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        job.record_webhook_outcome(true, 1, None, Some(Utc::now()))
            .unwrap();
        f.store.update_job(&job).await.unwrap();

        let status = f
            .projection
            .process_status(&number("p-7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.job_id, Some(job.job_id));
        assert!(status.webhook_sent);
        assert_eq!(
            status.webhook_url.as_deref(),
            Some("https://example.test/cb")
        );
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_some());
    }
}
