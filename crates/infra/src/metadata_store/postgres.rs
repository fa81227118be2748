//! Postgres-backed metadata store.
//!
//! Expected schema (managed by the deployment, mirroring the logical layout):
//!
//! ```sql
//! CREATE TABLE processes (
//!     process_number TEXT PRIMARY KEY,
//!     court          TEXT,
//!     subject        TEXT,
//!     summary        JSONB NOT NULL,
//!     has_documents  BOOLEAN NOT NULL,
//!     created_at     TIMESTAMPTZ NOT NULL,
//!     updated_at     TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE documents (
//!     process_number        TEXT NOT NULL REFERENCES processes (process_number),
//!     document_id           TEXT NOT NULL,
//!     name                  TEXT NOT NULL,
//!     mime_type             TEXT,
//!     size                  BIGINT,
//!     source_handle         TEXT NOT NULL,
//!     blob_key              TEXT,
//!     status                TEXT NOT NULL,
//!     error_message         TEXT,
//!     download_started_at   TIMESTAMPTZ,
//!     download_completed_at TIMESTAMPTZ,
//!     created_at            TIMESTAMPTZ NOT NULL,
//!     updated_at            TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (process_number, document_id)
//! );
//! CREATE INDEX documents_by_process ON documents (process_number);
//!
//! CREATE TABLE jobs (
//!     job_id              UUID PRIMARY KEY,
//!     process_number      TEXT NOT NULL REFERENCES processes (process_number),
//!     webhook_url         TEXT,
//!     status              TEXT NOT NULL,
//!     total_documents     INTEGER NOT NULL,
//!     completed_documents INTEGER NOT NULL,
//!     failed_documents    INTEGER NOT NULL,
//!     progress_percentage DOUBLE PRECISION NOT NULL,
//!     created_at          TIMESTAMPTZ NOT NULL,
//!     started_at          TIMESTAMPTZ,
//!     completed_at        TIMESTAMPTZ,
//!     webhook_sent        BOOLEAN NOT NULL,
//!     webhook_sent_at     TIMESTAMPTZ,
//!     webhook_attempts    INTEGER NOT NULL,
//!     webhook_last_error  TEXT,
//!     error_message       TEXT
//! );
//! CREATE INDEX jobs_by_process ON jobs (process_number);
//! CREATE UNIQUE INDEX jobs_one_active_per_process
//!     ON jobs (process_number)
//!     WHERE status IN ('pending', 'processing');
//! ```
//!
//! The partial unique index is the admission idempotency mechanism: a losing
//! concurrent insert fails with SQLSTATE 23505 and is surfaced as
//! `ActiveJobExists` carrying the winner's id.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use docket_core::{
    Document, DocumentId, DocumentStatus, Job, JobId, JobStatus, Process, ProcessNumber,
};

use super::{MetadataStore, MetadataStoreError, ProcessPage};

#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: Arc<PgPool>,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> MetadataStoreError {
    MetadataStoreError::Storage(format!("{operation}: {error}"))
}

fn document_status_from_str(raw: &str) -> Result<DocumentStatus, MetadataStoreError> {
    match raw {
        "pending" => Ok(DocumentStatus::Pending),
        "processing" => Ok(DocumentStatus::Processing),
        "available" => Ok(DocumentStatus::Available),
        "failed" => Ok(DocumentStatus::Failed),
        other => Err(MetadataStoreError::Storage(format!(
            "unknown document status in storage: {other}"
        ))),
    }
}

fn job_status_from_str(raw: &str) -> Result<JobStatus, MetadataStoreError> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(MetadataStoreError::Storage(format!(
            "unknown job status in storage: {other}"
        ))),
    }
}

fn process_from_row(row: &sqlx::postgres::PgRow) -> Result<Process, MetadataStoreError> {
    let number: String = row
        .try_get("process_number")
        .map_err(|e| map_sqlx_error("process_from_row", e))?;
    Ok(Process {
        process_number: ProcessNumber::new(number)
            .map_err(|e| MetadataStoreError::Storage(e.to_string()))?,
        court: row.try_get("court").map_err(|e| map_sqlx_error("process_from_row", e))?,
        subject: row
            .try_get("subject")
            .map_err(|e| map_sqlx_error("process_from_row", e))?,
        summary: row
            .try_get("summary")
            .map_err(|e| map_sqlx_error("process_from_row", e))?,
        has_documents: row
            .try_get("has_documents")
            .map_err(|e| map_sqlx_error("process_from_row", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx_error("process_from_row", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| map_sqlx_error("process_from_row", e))?,
    })
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<Document, MetadataStoreError> {
    let number: String = row
        .try_get("process_number")
        .map_err(|e| map_sqlx_error("document_from_row", e))?;
    let document_id: String = row
        .try_get("document_id")
        .map_err(|e| map_sqlx_error("document_from_row", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("document_from_row", e))?;
    let size: Option<i64> = row
        .try_get("size")
        .map_err(|e| map_sqlx_error("document_from_row", e))?;
    Ok(Document {
        document_id: DocumentId::new(document_id)
            .map_err(|e| MetadataStoreError::Storage(e.to_string()))?,
        process_number: ProcessNumber::new(number)
            .map_err(|e| MetadataStoreError::Storage(e.to_string()))?,
        name: row
            .try_get("name")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        mime_type: row
            .try_get("mime_type")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        size: size.map(|s| s.max(0) as u64),
        source_handle: row
            .try_get("source_handle")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        blob_key: row
            .try_get("blob_key")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        status: document_status_from_str(&status)?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        download_started_at: row
            .try_get("download_started_at")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        download_completed_at: row
            .try_get("download_completed_at")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| map_sqlx_error("document_from_row", e))?,
    })
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, MetadataStoreError> {
    let job_id: uuid::Uuid = row
        .try_get("job_id")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let number: String = row
        .try_get("process_number")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let total: i32 = row
        .try_get("total_documents")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let completed: i32 = row
        .try_get("completed_documents")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let failed: i32 = row
        .try_get("failed_documents")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    let attempts: i32 = row
        .try_get("webhook_attempts")
        .map_err(|e| map_sqlx_error("job_from_row", e))?;
    Ok(Job {
        job_id: JobId::from_uuid(job_id),
        process_number: ProcessNumber::new(number)
            .map_err(|e| MetadataStoreError::Storage(e.to_string()))?,
        webhook_url: row
            .try_get("webhook_url")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        status: job_status_from_str(&status)?,
        total_documents: total.max(0) as u32,
        completed_documents: completed.max(0) as u32,
        failed_documents: failed.max(0) as u32,
        progress_percentage: row
            .try_get("progress_percentage")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        webhook_sent: row
            .try_get("webhook_sent")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        webhook_sent_at: row
            .try_get("webhook_sent_at")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        webhook_attempts: attempts.max(0) as u32,
        webhook_last_error: row
            .try_get("webhook_last_error")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    #[instrument(skip(self, process), fields(process_number = %process.process_number), err)]
    async fn upsert_process(&self, process: &Process) -> Result<(), MetadataStoreError> {
        sqlx::query(
            r#"
            INSERT INTO processes
                (process_number, court, subject, summary, has_documents, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (process_number) DO UPDATE SET
                court = EXCLUDED.court,
                subject = EXCLUDED.subject,
                summary = EXCLUDED.summary,
                has_documents = EXCLUDED.has_documents,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(process.process_number.as_str())
        .bind(&process.court)
        .bind(&process.subject)
        .bind(&process.summary)
        .bind(process.has_documents)
        .bind(process.created_at)
        .bind(process.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_process", e))?;
        Ok(())
    }

    async fn get_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Process>, MetadataStoreError> {
        let row = sqlx::query("SELECT * FROM processes WHERE process_number = $1")
            .bind(process_number.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_process", e))?;
        row.as_ref().map(process_from_row).transpose()
    }

    async fn list_processes(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<ProcessPage, MetadataStoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processes")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_processes", e))?;

        let rows = sqlx::query(
            "SELECT * FROM processes ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_processes", e))?;

        let processes = rows
            .iter()
            .map(process_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessPage {
            processes,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self, documents), fields(count = documents.len()), err)]
    async fn seed_documents(&self, documents: &[Document]) -> Result<u32, MetadataStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("seed_documents", e))?;

        let mut inserted = 0u32;
        for document in documents {
            let result = sqlx::query(
                r#"
                INSERT INTO documents
                    (process_number, document_id, name, mime_type, size, source_handle,
                     blob_key, status, error_message, download_started_at,
                     download_completed_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (process_number, document_id) DO NOTHING
                "#,
            )
            .bind(document.process_number.as_str())
            .bind(document.document_id.as_str())
            .bind(&document.name)
            .bind(&document.mime_type)
            .bind(document.size.map(|s| s as i64))
            .bind(&document.source_handle)
            .bind(&document.blob_key)
            .bind(document.status.as_str())
            .bind(&document.error_message)
            .bind(document.download_started_at)
            .bind(document.download_completed_at)
            .bind(document.created_at)
            .bind(document.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("seed_documents", e))?;
            inserted += result.rows_affected() as u32;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("seed_documents", e))?;
        Ok(inserted)
    }

    async fn list_documents(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Vec<Document>, MetadataStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE process_number = $1 ORDER BY document_id ASC",
        )
        .bind(process_number.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_documents", e))?;
        rows.iter().map(document_from_row).collect()
    }

    async fn get_document(
        &self,
        process_number: &ProcessNumber,
        document_id: &DocumentId,
    ) -> Result<Option<Document>, MetadataStoreError> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE process_number = $1 AND document_id = $2",
        )
        .bind(process_number.as_str())
        .bind(document_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_document", e))?;
        row.as_ref().map(document_from_row).transpose()
    }

    #[instrument(
        skip(self, document),
        fields(document_id = %document.document_id, status = %document.status),
        err
    )]
    async fn update_document(&self, document: &Document) -> Result<(), MetadataStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                name = $3, mime_type = $4, size = $5, source_handle = $6,
                blob_key = $7, status = $8, error_message = $9,
                download_started_at = $10, download_completed_at = $11, updated_at = $12
            WHERE process_number = $1 AND document_id = $2
            "#,
        )
        .bind(document.process_number.as_str())
        .bind(document.document_id.as_str())
        .bind(&document.name)
        .bind(&document.mime_type)
        .bind(document.size.map(|s| s as i64))
        .bind(&document.source_handle)
        .bind(&document.blob_key)
        .bind(document.status.as_str())
        .bind(&document.error_message)
        .bind(document.download_started_at)
        .bind(document.download_completed_at)
        .bind(document.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_document", e))?;

        if result.rows_affected() == 0 {
            return Err(MetadataStoreError::NotFound(format!(
                "document {} of process {}",
                document.document_id, document.process_number
            )));
        }
        Ok(())
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.job_id, process_number = %job.process_number),
        err
    )]
    async fn insert_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, process_number, webhook_url, status, total_documents,
                 completed_documents, failed_documents, progress_percentage,
                 created_at, started_at, completed_at, webhook_sent,
                 webhook_sent_at, webhook_attempts, webhook_last_error, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.process_number.as_str())
        .bind(&job.webhook_url)
        .bind(job.status.as_str())
        .bind(job.total_documents as i32)
        .bind(job.completed_documents as i32)
        .bind(job.failed_documents as i32)
        .bind(job.progress_percentage)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.webhook_sent)
        .bind(job.webhook_sent_at)
        .bind(job.webhook_attempts as i32)
        .bind(&job.webhook_last_error)
        .bind(&job.error_message)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                // The partial unique index fired: report the winner.
                let winner = self.find_active_job(&job.process_number).await?;
                match winner {
                    Some(active) => Err(MetadataStoreError::ActiveJobExists {
                        process_number: job.process_number.clone(),
                        job_id: active.job_id,
                    }),
                    // The winner finished between our insert and this read;
                    // surface a retryable storage error.
                    None => Err(MetadataStoreError::Storage(
                        "active-job constraint fired but no active job is visible".to_string(),
                    )),
                }
            }
            Err(e) => Err(map_sqlx_error("insert_job", e)),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_active_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE process_number = $1 AND status IN ('pending', 'processing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(process_number.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_latest_job(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<Option<Job>, MetadataStoreError> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE process_number = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(process_number.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_latest_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, MetadataStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = COALESCE(started_at, NOW())
            WHERE job_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, status = %job.status), err)]
    async fn update_job(&self, job: &Job) -> Result<(), MetadataStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                webhook_url = $2, status = $3, total_documents = $4,
                completed_documents = $5, failed_documents = $6,
                progress_percentage = $7, started_at = $8, completed_at = $9,
                webhook_sent = $10, webhook_sent_at = $11, webhook_attempts = $12,
                webhook_last_error = $13, error_message = $14
            WHERE job_id = $1
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(&job.webhook_url)
        .bind(job.status.as_str())
        .bind(job.total_documents as i32)
        .bind(job.completed_documents as i32)
        .bind(job.failed_documents as i32)
        .bind(job.progress_percentage)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.webhook_sent)
        .bind(job.webhook_sent_at)
        .bind(job.webhook_attempts as i32)
        .bind(&job.webhook_last_error)
        .bind(&job.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(MetadataStoreError::NotFound(format!("job {}", job.job_id)));
        }
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: JobId,
        completed: u32,
        failed: u32,
        progress: f64,
    ) -> Result<(), MetadataStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                completed_documents = $2,
                failed_documents = $3,
                progress_percentage = $4
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(completed as i32)
        .bind(failed as i32)
        .bind(progress)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_progress", e))?;

        if result.rows_affected() == 0 {
            return Err(MetadataStoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }
}
