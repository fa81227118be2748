//! In-memory metadata store for dev/test.
//!
//! Single mutex around all three tables so the active-job check and the job
//! insert commit as one unit, exactly like the partial unique index in the
//! Postgres implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use docket_core::{Document, DocumentId, Job, JobId, JobStatus, Process, ProcessNumber};

use super::{MetadataStore, MetadataStoreError, ProcessPage};

#[derive(Debug, Default)]
struct Tables {
    processes: HashMap<ProcessNumber, Process>,
    documents: HashMap<(ProcessNumber, DocumentId), Document>,
    jobs: HashMap<JobId, Job>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: Mutex<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert_process(&self, process: &Process) -> Result<(), MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .processes
            .insert(process.process_number.clone(), process.clone());
        Ok(())
    }

    async fn get_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Process>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.processes.get(process_number).cloned())
    }

    async fn list_processes(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<ProcessPage, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        let mut processes: Vec<Process> = tables.processes.values().cloned().collect();
        processes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = processes.len() as u64;
        let processes = processes
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(ProcessPage { processes, total })
    }

    async fn seed_documents(&self, documents: &[Document]) -> Result<u32, MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for document in documents {
            let key = (
                document.process_number.clone(),
                document.document_id.clone(),
            );
            if !tables.documents.contains_key(&key) {
                tables.documents.insert(key, document.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_documents(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Vec<Document>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        let mut documents: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| &d.process_number == process_number)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.document_id.as_str().cmp(b.document_id.as_str()));
        Ok(documents)
    }

    async fn get_document(
        &self,
        process_number: &ProcessNumber,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .documents
            .get(&(process_number.clone(), document_id.clone()))
            .cloned())
    }

    async fn update_document(&self, document: &Document) -> Result<(), MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        let key = (
            document.process_number.clone(),
            document.document_id.clone(),
        );
        if !tables.documents.contains_key(&key) {
            return Err(MetadataStoreError::NotFound(format!(
                "document {} of process {}",
                document.document_id, document.process_number
            )));
        }
        tables.documents.insert(key, document.clone());
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(active) = tables
            .jobs
            .values()
            .find(|j| j.process_number == job.process_number && j.is_active())
        {
            return Err(MetadataStoreError::ActiveJobExists {
                process_number: job.process_number.clone(),
                job_id: active.job_id,
            });
        }
        tables.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.jobs.get(&job_id).cloned())
    }

    async fn find_active_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .find(|j| &j.process_number == process_number && j.is_active())
            .cloned())
    }

    async fn find_latest_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .filter(|j| &j.process_number == process_number)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        match tables.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.transition(JobStatus::Processing)?;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.jobs.contains_key(&job.job_id) {
            return Err(MetadataStoreError::NotFound(format!("job {}", job.job_id)));
        }
        tables.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: JobId,
        completed: u32,
        failed: u32,
        progress: f64,
    ) -> Result<(), MetadataStoreError> {
        let mut tables = self.tables.lock().unwrap();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| MetadataStoreError::NotFound(format!("job {job_id}")))?;
        job.completed_documents = completed;
        job.failed_documents = failed;
        job.progress_percentage = progress;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::DocumentStatus;

    fn process_number(n: &str) -> ProcessNumber {
        ProcessNumber::new(n).unwrap()
    }

    fn sample_process(n: &str) -> Process {
        Process::new(
            process_number(n),
            Some("TJSP".to_string()),
            None,
            serde_json::json!({}),
            true,
        )
    }

    fn sample_document(n: &str, id: &str) -> Document {
        Document::new(
            DocumentId::new(id).unwrap(),
            process_number(n),
            format!("{id}.pdf"),
            Some("application/pdf".to_string()),
            format!("https://portal.example/docs/{id}"),
            DocumentStatus::Pending,
        )
    }

    #[tokio::test]
    async fn upsert_and_get_process() {
        let store = InMemoryMetadataStore::new();
        store.upsert_process(&sample_process("p-1")).await.unwrap();

        let found = store.get_process(&process_number("p-1")).await.unwrap();
        assert!(found.is_some());
        assert!(store
            .get_process(&process_number("p-2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn seeding_is_insert_if_absent() {
        let store = InMemoryMetadataStore::new();
        let docs = vec![sample_document("p-1", "d-1"), sample_document("p-1", "d-2")];
        assert_eq!(store.seed_documents(&docs).await.unwrap(), 2);

        // Mutate one row, then re-seed: the mutation survives.
        let mut d1 = store
            .get_document(&process_number("p-1"), &DocumentId::new("d-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        d1.transition(DocumentStatus::Processing).unwrap();
        store.update_document(&d1).await.unwrap();

        assert_eq!(store.seed_documents(&docs).await.unwrap(), 0);
        let kept = store
            .get_document(&process_number("p-1"), &DocumentId::new("d-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn second_active_job_is_rejected() {
        let store = InMemoryMetadataStore::new();
        let first = Job::new(process_number("p-1"), None);
        store.insert_job(&first).await.unwrap();

        let second = Job::new(process_number("p-1"), None);
        let err = store.insert_job(&second).await.unwrap_err();
        match err {
            MetadataStoreError::ActiveJobExists { job_id, .. } => {
                assert_eq!(job_id, first.job_id);
            }
            other => panic!("expected ActiveJobExists, got {other:?}"),
        }

        // A different process is unaffected.
        store
            .insert_job(&Job::new(process_number("p-2"), None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_job_frees_the_constraint() {
        let store = InMemoryMetadataStore::new();
        let mut job = Job::new(process_number("p-1"), None);
        store.insert_job(&job).await.unwrap();

        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        store.update_job(&job).await.unwrap();

        store
            .insert_job(&Job::new(process_number("p-1"), None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_is_single_shot() {
        let store = InMemoryMetadataStore::new();
        let job = Job::new(process_number("p-1"), None);
        store.insert_job(&job).await.unwrap();

        let claimed = store.claim_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());

        // Redelivered ticket: claim refuses.
        assert!(store.claim_job(job.job_id).await.unwrap().is_none());
        // Unknown job: same.
        assert!(store.claim_job(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_job_wins_by_creation_time() {
        let store = InMemoryMetadataStore::new();
        let mut first = Job::new(process_number("p-1"), None);
        first.transition(JobStatus::Processing).unwrap();
        first.transition(JobStatus::Failed).unwrap();
        store.insert_job(&first).await.unwrap();

        let second = Job::new(process_number("p-1"), None);
        store.insert_job(&second).await.unwrap();

        let latest = store
            .find_latest_job(&process_number("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.job_id, second.job_id);
    }

    #[tokio::test]
    async fn list_processes_pages_newest_first() {
        let store = InMemoryMetadataStore::new();
        for i in 0..5 {
            store
                .upsert_process(&sample_process(&format!("p-{i}")))
                .await
                .unwrap();
        }
        let page = store.list_processes(2, 0).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.processes.len(), 2);
    }
}
