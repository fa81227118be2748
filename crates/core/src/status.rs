//! Document and job status machines.
//!
//! Both statuses are closed enums with an adjacent legality table. Every
//! mutation in the infra layer consults `ensure_*_transition` before
//! committing; nothing outside this module compares status strings.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Processing status of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Waiting for a worker to begin the download.
    Pending,
    /// Download/upload in flight.
    Processing,
    /// Stored in the blob store; terminal and immutable.
    Available,
    /// Download or upload failed; the retry door back to Processing stays open.
    Failed,
}

impl DocumentStatus {
    /// Legal transitions per the document table.
    ///
    /// `Available` accepts nothing; `Failed -> Processing` is the retry door.
    pub fn can_transition(self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Pending, Failed) | (Processing, Available)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Available | DocumentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Available => "available",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a materialization job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, ticket enqueued, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker; documents are being materialized.
    Processing,
    /// All documents reached Available.
    Completed,
    /// At least one document ended Failed, or the run was aborted.
    Failed,
    /// Cancelled externally; the worker stops between batches.
    Cancelled,
}

impl JobStatus {
    /// Legal transitions per the job table.
    ///
    /// `Failed -> Processing` and `Cancelled -> Processing` allow an operator
    /// re-run; `Completed` accepts nothing.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Processing)
                | (Cancelled, Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// A job counts against the one-active-job-per-process constraint.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a document transition, surfacing the table verdict as an error.
pub fn ensure_document_transition(
    from: DocumentStatus,
    to: DocumentStatus,
) -> DomainResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(DomainError::invalid_transition("document", from, to))
    }
}

/// Validate a job transition, surfacing the table verdict as an error.
pub fn ensure_job_transition(from: JobStatus, to: JobStatus) -> DomainResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(DomainError::invalid_transition("job", from, to))
    }
}

/// Initial status for freshly seeded documents.
///
/// With a webhook the caller will be told when everything is done, so
/// documents sit in Pending until a worker picks them up. Without one,
/// pollers should see activity immediately, so they start in Processing.
pub fn initial_document_status(has_webhook: bool) -> DocumentStatus {
    if has_webhook {
        DocumentStatus::Pending
    } else {
        DocumentStatus::Processing
    }
}
