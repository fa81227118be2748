//! Upstream portal client seam.
//!
//! The portal is a black box that serves process metadata (including the
//! document listing) and document binaries addressed by an opaque source
//! handle. Errors carry a transient/permanent classification, but the worker
//! deliberately retries both kinds up to its attempt budget - the
//! classification exists for logging and for callers that want to
//! short-circuit.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use docket_core::{DocumentId, ProcessNumber};

mod http;
mod memory;

pub use http::HttpUpstreamClient;
pub use memory::InMemoryUpstreamClient;

/// Metadata the portal returns for one process.
#[derive(Debug, Clone)]
pub struct ProcessMetadata {
    pub process_number: ProcessNumber,
    pub court: Option<String>,
    pub subject: Option<String>,
    /// Full upstream response body, stored opaquely.
    pub summary: JsonValue,
    pub documents: Vec<DocumentListing>,
}

/// One entry of the portal's document listing.
#[derive(Debug, Clone)]
pub struct DocumentListing {
    pub document_id: DocumentId,
    pub name: String,
    pub mime_type: Option<String>,
    /// Opaque pointer used to fetch the binary.
    pub source_handle: String,
}

/// Downloaded document content.
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream connection error: {0}")]
    Connect(String),

    #[error("upstream returned HTTP {code}")]
    Status { code: u16 },

    #[error("upstream response could not be decoded: {0}")]
    Decode(String),

    #[error("upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Timeouts, connection failures, and 5xx are transient; everything else
    /// is logically permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Timeout | UpstreamError::Connect(_) => true,
            UpstreamError::Status { code } => *code >= 500,
            UpstreamError::Decode(_) | UpstreamError::Other(_) => false,
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch process metadata and its document listing.
    async fn fetch_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<ProcessMetadata, UpstreamError>;

    /// Fetch one document's bytes by its source handle.
    async fn fetch_document(&self, source_handle: &str)
        -> Result<DocumentPayload, UpstreamError>;
}

#[async_trait]
impl<U> UpstreamClient for Arc<U>
where
    U: UpstreamClient + ?Sized,
{
    async fn fetch_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<ProcessMetadata, UpstreamError> {
        (**self).fetch_process(process_number).await
    }

    async fn fetch_document(
        &self,
        source_handle: &str,
    ) -> Result<DocumentPayload, UpstreamError> {
        (**self).fetch_document(source_handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(UpstreamError::Timeout.is_transient());
        assert!(UpstreamError::Connect("reset".to_string()).is_transient());
        assert!(UpstreamError::Status { code: 500 }.is_transient());
        assert!(UpstreamError::Status { code: 503 }.is_transient());
        assert!(!UpstreamError::Status { code: 404 }.is_transient());
        assert!(!UpstreamError::Status { code: 403 }.is_transient());
        assert!(!UpstreamError::Decode("bad json".to_string()).is_transient());
    }
}
