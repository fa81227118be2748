//! Metadata store seam: transactional storage for processes, documents, jobs.
//!
//! The one-active-job-per-process constraint lives *here*, not in the
//! scheduler: `insert_job` is an optimistic insert that fails with
//! [`MetadataStoreError::ActiveJobExists`] when another active job holds the
//! process, and the scheduler falls back on that error. "Check, then act"
//! races cannot create duplicate admissions.

use async_trait::async_trait;
use std::sync::Arc;

use docket_core::{Document, DocumentId, DomainError, Job, JobId, Process, ProcessNumber};

mod memory;
#[cfg(feature = "persistent")]
mod postgres;

pub use memory::InMemoryMetadataStore;
#[cfg(feature = "persistent")]
pub use postgres::PostgresMetadataStore;

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-violation on the active-job constraint; carries the winner.
    #[error("active job {job_id} already exists for process {process_number}")]
    ActiveJobExists {
        process_number: ProcessNumber,
        job_id: JobId,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// A page of processes plus the total row count.
#[derive(Debug, Clone)]
pub struct ProcessPage {
    pub processes: Vec<Process>,
    pub total: u64,
}

/// Transactional record storage for the materialization pipeline.
///
/// Writers: the scheduler (process upsert, document seeding, job insert) and
/// the owning worker (everything else). Readers may observe any committed
/// snapshot; no adapter-level retries - errors surface and the two retry loci
/// decide.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Processes ------------------------------------------------------------

    /// Insert or replace the process record keyed by its number.
    async fn upsert_process(&self, process: &Process) -> Result<(), MetadataStoreError>;

    async fn get_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Process>, MetadataStoreError>;

    /// Newest-first page of known processes.
    async fn list_processes(&self, limit: u32, offset: u32)
        -> Result<ProcessPage, MetadataStoreError>;

    // Documents ------------------------------------------------------------

    /// Insert documents that do not exist yet; existing rows are left
    /// untouched. Returns the number of rows actually inserted.
    async fn seed_documents(&self, documents: &[Document]) -> Result<u32, MetadataStoreError>;

    async fn list_documents(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Vec<Document>, MetadataStoreError>;

    async fn get_document(
        &self,
        process_number: &ProcessNumber,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, MetadataStoreError>;

    /// Persist a document mutated by the owning worker. The caller has
    /// already run the transition through the status tables.
    async fn update_document(&self, document: &Document) -> Result<(), MetadataStoreError>;

    // Jobs -----------------------------------------------------------------

    /// Optimistic insert honoring the one-active-job-per-process constraint.
    async fn insert_job(&self, job: &Job) -> Result<(), MetadataStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError>;

    async fn find_active_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError>;

    /// Most recently created job for the process, regardless of status.
    async fn find_latest_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError>;

    /// Atomic Pending -> Processing claim. Returns the claimed job, or `None`
    /// when the job is missing or no longer Pending (the worker's idempotency
    /// guard against at-least-once ticket redelivery).
    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError>;

    /// Persist job fields written by the owning worker (webhook outcome,
    /// terminal state, totals).
    async fn update_job(&self, job: &Job) -> Result<(), MetadataStoreError>;

    /// Counters-only write after the worker's in-memory tally. Touches
    /// nothing else, so a concurrent cancellation is never clobbered.
    async fn update_job_progress(
        &self,
        job_id: JobId,
        completed: u32,
        failed: u32,
        progress: f64,
    ) -> Result<(), MetadataStoreError>;
}

#[async_trait]
impl<S> MetadataStore for Arc<S>
where
    S: MetadataStore + ?Sized,
{
    async fn upsert_process(&self, process: &Process) -> Result<(), MetadataStoreError> {
        (**self).upsert_process(process).await
    }

    async fn get_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Process>, MetadataStoreError> {
        (**self).get_process(process_number).await
    }

    async fn list_processes(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<ProcessPage, MetadataStoreError> {
        (**self).list_processes(limit, offset).await
    }

    async fn seed_documents(&self, documents: &[Document]) -> Result<u32, MetadataStoreError> {
        (**self).seed_documents(documents).await
    }

    async fn list_documents(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Vec<Document>, MetadataStoreError> {
        (**self).list_documents(process_number).await
    }

    async fn get_document(
        &self,
        process_number: &ProcessNumber,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, MetadataStoreError> {
        (**self).get_document(process_number, document_id).await
    }

    async fn update_document(&self, document: &Document) -> Result<(), MetadataStoreError> {
        (**self).update_document(document).await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        (**self).insert_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        (**self).get_job(job_id).await
    }

    async fn find_active_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        (**self).find_active_job(process_number).await
    }

    async fn find_latest_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        (**self).find_latest_job(process_number).await
    }

    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        (**self).claim_job(job_id).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        (**self).update_job(job).await
    }

    async fn update_job_progress(
        &self,
        job_id: JobId,
        completed: u32,
        failed: u32,
        progress: f64,
    ) -> Result<(), MetadataStoreError> {
        (**self)
            .update_job_progress(job_id, completed, failed, progress)
            .await
    }
}
