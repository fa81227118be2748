//! Process, document, and job records plus their invariant-preserving mutators.
//!
//! These are plain data carriers; persistence lives behind the metadata-store
//! seam in the infra layer. All status changes funnel through [`crate::status`]
//! so the legality tables cannot be bypassed by accident - the only exception
//! is the worker's documented force-fail safety net.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{DocumentId, JobId, ProcessNumber};
use crate::status::{
    ensure_document_transition, ensure_job_transition, DocumentStatus, JobStatus,
};

/// One court process as known locally.
///
/// Created on first materialization request; `summary` is the opaque upstream
/// metadata blob, refreshed whenever the portal is re-queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub process_number: ProcessNumber,
    pub court: Option<String>,
    pub subject: Option<String>,
    pub summary: JsonValue,
    pub has_documents: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn new(
        process_number: ProcessNumber,
        court: Option<String>,
        subject: Option<String>,
        summary: JsonValue,
        has_documents: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_number,
            court,
            subject,
            summary,
            has_documents,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the upstream metadata after a re-fetch.
    pub fn refresh(
        &mut self,
        court: Option<String>,
        subject: Option<String>,
        summary: JsonValue,
        has_documents: bool,
    ) {
        self.court = court;
        self.subject = subject;
        self.summary = summary;
        self.has_documents = has_documents;
        self.updated_at = Utc::now();
    }
}

/// One downloadable file attached to a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub process_number: ProcessNumber,
    pub name: String,
    pub mime_type: Option<String>,
    /// Size in bytes, known only after a successful download.
    pub size: Option<u64>,
    /// Opaque pointer handed to the upstream client to fetch the bytes.
    pub source_handle: String,
    /// Object-store key, set on successful upload.
    pub blob_key: Option<String>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Object-store key for a document: `processes/{process}/documents/{id}/{name}`.
pub fn blob_key(process_number: &ProcessNumber, document_id: &DocumentId, name: &str) -> String {
    format!(
        "processes/{}/documents/{}/{}",
        process_number, document_id, name
    )
}

impl Document {
    pub fn new(
        document_id: DocumentId,
        process_number: ProcessNumber,
        name: impl Into<String>,
        mime_type: Option<String>,
        source_handle: impl Into<String>,
        status: DocumentStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            document_id,
            process_number,
            name: name.into(),
            mime_type,
            size: None,
            source_handle: source_handle.into(),
            blob_key: None,
            status,
            error_message: None,
            download_started_at: None,
            download_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Table-checked status change. Begin-of-attempt bookkeeping happens here:
    /// entering Processing stamps `download_started_at`.
    pub fn transition(&mut self, to: DocumentStatus) -> DomainResult<()> {
        ensure_document_transition(self.status, to)?;
        self.status = to;
        self.updated_at = Utc::now();
        if to == DocumentStatus::Processing {
            self.download_started_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Processing -> Available with the fields the invariant demands: a blob
    /// key, a finite size, and a completion timestamp.
    pub fn mark_available(
        &mut self,
        blob_key: impl Into<String>,
        size: u64,
        mime_type: Option<String>,
    ) -> DomainResult<()> {
        let key = blob_key.into();
        if key.is_empty() {
            return Err(DomainError::validation("blob key must be non-empty"));
        }
        ensure_document_transition(self.status, DocumentStatus::Available)?;
        self.status = DocumentStatus::Available;
        self.blob_key = Some(key);
        self.size = Some(size);
        if mime_type.is_some() {
            self.mime_type = mime_type;
        }
        self.error_message = None;
        self.updated_at = Utc::now();
        self.download_completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Table-checked failure. The message is mandatory (a Failed document
    /// without a reason is useless to both pollers and operators).
    pub fn mark_failed(&mut self, message: impl Into<String>) -> DomainResult<()> {
        let message = message.into();
        if message.is_empty() {
            return Err(DomainError::validation("failure message must be non-empty"));
        }
        ensure_document_transition(self.status, DocumentStatus::Failed)?;
        self.status = DocumentStatus::Failed;
        self.error_message = Some(message);
        self.updated_at = Utc::now();
        self.download_completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Safety net for the worker's terminal error path: force Failed from any
    /// non-terminal state, bypassing the table. Returns an error only when the
    /// document is already terminal. Callers log every use.
    pub fn force_failed(&mut self, message: impl Into<String>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(
                "document",
                self.status,
                DocumentStatus::Failed,
            ));
        }
        let message = message.into();
        self.status = DocumentStatus::Failed;
        self.error_message = Some(if message.is_empty() {
            "failed".to_string()
        } else {
            message
        });
        self.updated_at = Utc::now();
        self.download_completed_at = Some(self.updated_at);
        Ok(())
    }

    /// UUID the upstream embeds in the source handle, used as the stable
    /// `uuid` field of callback payloads. Falls back to the external id when
    /// the handle carries none.
    pub fn external_uuid(&self) -> String {
        self.source_handle
            .split(['/', '?'])
            .find(|segment| Uuid::parse_str(segment).is_ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.document_id.to_string())
    }
}

/// One unit of "materialize this process".
///
/// Created by the scheduler at admission, then owned exclusively by a single
/// worker between claim and terminal commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub process_number: ProcessNumber,
    pub webhook_url: Option<String>,
    pub status: JobStatus,
    pub total_documents: u32,
    pub completed_documents: u32,
    pub failed_documents: u32,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub webhook_sent: bool,
    pub webhook_sent_at: Option<DateTime<Utc>>,
    pub webhook_attempts: u32,
    pub webhook_last_error: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(process_number: ProcessNumber, webhook_url: Option<String>) -> Self {
        Self {
            job_id: JobId::new(),
            process_number,
            webhook_url,
            status: JobStatus::Pending,
            total_documents: 0,
            completed_documents: 0,
            failed_documents: 0,
            progress_percentage: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            webhook_sent: false,
            webhook_sent_at: None,
            webhook_attempts: 0,
            webhook_last_error: None,
            error_message: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Table-checked status change. Entering Processing stamps `started_at`;
    /// entering any terminal state stamps `completed_at`.
    pub fn transition(&mut self, to: JobStatus) -> DomainResult<()> {
        ensure_job_transition(self.status, to)?;
        self.status = to;
        let now = Utc::now();
        if to == JobStatus::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Commit the worker's in-memory tally. Counters may never exceed the
    /// total, and the percentage is derived, never stored independently.
    pub fn set_progress(&mut self, completed: u32, failed: u32) -> DomainResult<()> {
        if u64::from(completed) + u64::from(failed) > u64::from(self.total_documents) {
            return Err(DomainError::validation(format!(
                "document counters exceed total: {} + {} > {}",
                completed, failed, self.total_documents
            )));
        }
        self.completed_documents = completed;
        self.failed_documents = failed;
        self.progress_percentage =
            100.0 * f64::from(completed + failed) / f64::from(self.total_documents.max(1));
        Ok(())
    }

    /// Terminal status once every document has settled.
    pub fn terminal_status(&self) -> JobStatus {
        if self.failed_documents == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }

    /// Record the dispatcher's delivery report. A job without a webhook URL
    /// keeps `webhook_sent = false` forever; calling this without one is a
    /// programming error surfaced as a validation failure.
    pub fn record_webhook_outcome(
        &mut self,
        success: bool,
        attempts: u32,
        last_error: Option<String>,
        sent_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        if self.webhook_url.is_none() {
            return Err(DomainError::validation(
                "webhook outcome recorded on a job without a webhook URL",
            ));
        }
        self.webhook_sent = success;
        self.webhook_sent_at = if success { sent_at } else { None };
        self.webhook_attempts = attempts;
        self.webhook_last_error = last_error;
        Ok(())
    }
}
