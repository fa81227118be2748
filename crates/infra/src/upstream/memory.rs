//! Scripted in-memory upstream client for dev/test.
//!
//! Registered processes and document bytes are served from memory; failures
//! can be injected per handle, either a fixed number of times (to exercise
//! retries) or persistently (to exhaust them). Fetch counts are recorded so
//! tests can assert the retry budget is honored.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use docket_core::ProcessNumber;

use super::{DocumentPayload, ProcessMetadata, UpstreamClient, UpstreamError};

#[derive(Debug, Clone)]
struct ScriptedFailure {
    error: UpstreamError,
    /// `None` fails forever; `Some(n)` fails the next n fetches.
    remaining: Option<u32>,
}

#[derive(Default)]
struct Script {
    processes: HashMap<ProcessNumber, ProcessMetadata>,
    process_failures: HashMap<ProcessNumber, ScriptedFailure>,
    documents: HashMap<String, DocumentPayload>,
    document_failures: HashMap<String, ScriptedFailure>,
    fetch_counts: HashMap<String, u32>,
}

#[derive(Default)]
pub struct InMemoryUpstreamClient {
    script: Mutex<Script>,
}

impl InMemoryUpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_process(&self, metadata: ProcessMetadata) {
        let mut script = self.script.lock().unwrap();
        script
            .processes
            .insert(metadata.process_number.clone(), metadata);
    }

    pub fn register_document(&self, source_handle: impl Into<String>, payload: DocumentPayload) {
        let mut script = self.script.lock().unwrap();
        script.documents.insert(source_handle.into(), payload);
    }

    /// Fail the next `times` fetches of this handle (`None` = forever).
    pub fn fail_document(
        &self,
        source_handle: impl Into<String>,
        error: UpstreamError,
        times: Option<u32>,
    ) {
        let mut script = self.script.lock().unwrap();
        script.document_failures.insert(
            source_handle.into(),
            ScriptedFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Fail the next metadata fetches for this process (`None` = forever).
    pub fn fail_process(
        &self,
        process_number: ProcessNumber,
        error: UpstreamError,
        times: Option<u32>,
    ) {
        let mut script = self.script.lock().unwrap();
        script.process_failures.insert(
            process_number,
            ScriptedFailure {
                error,
                remaining: times,
            },
        );
    }

    /// How many times a document handle has been fetched.
    pub fn fetch_count(&self, source_handle: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .fetch_counts
            .get(source_handle)
            .copied()
            .unwrap_or(0)
    }
}

fn take_failure<K: std::hash::Hash + Eq>(
    failures: &mut HashMap<K, ScriptedFailure>,
    key: &K,
) -> Option<UpstreamError>
where
    K: Clone,
{
    let failure = failures.get_mut(key)?;
    match &mut failure.remaining {
        None => Some(failure.error.clone()),
        Some(0) => {
            failures.remove(key);
            None
        }
        Some(remaining) => {
            *remaining -= 1;
            let error = failure.error.clone();
            if failure.remaining == Some(0) {
                failures.remove(key);
            }
            Some(error)
        }
    }
}

#[async_trait]
impl UpstreamClient for InMemoryUpstreamClient {
    async fn fetch_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<ProcessMetadata, UpstreamError> {
        let mut script = self.script.lock().unwrap();
        if let Some(error) = take_failure(&mut script.process_failures, process_number) {
            return Err(error);
        }
        script
            .processes
            .get(process_number)
            .cloned()
            .ok_or(UpstreamError::Status { code: 404 })
    }

    async fn fetch_document(
        &self,
        source_handle: &str,
    ) -> Result<DocumentPayload, UpstreamError> {
        let mut script = self.script.lock().unwrap();
        *script
            .fetch_counts
            .entry(source_handle.to_string())
            .or_insert(0) += 1;
        let key = source_handle.to_string();
        if let Some(error) = take_failure(&mut script.document_failures, &key) {
            return Err(error);
        }
        script
            .documents
            .get(source_handle)
            .cloned()
            .ok_or(UpstreamError::Status { code: 404 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::DocumentId;
    use serde_json::json;

    fn metadata(n: &str) -> ProcessMetadata {
        ProcessMetadata {
            process_number: ProcessNumber::new(n).unwrap(),
            court: Some("TJSP".to_string()),
            subject: None,
            summary: json!({"court": "TJSP"}),
            documents: vec![super::super::DocumentListing {
                document_id: DocumentId::new("d-1").unwrap(),
                name: "d-1.pdf".to_string(),
                mime_type: Some("application/pdf".to_string()),
                source_handle: "handle-1".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn serves_registered_processes() {
        let upstream = InMemoryUpstreamClient::new();
        upstream.register_process(metadata("p-1"));

        let got = upstream
            .fetch_process(&ProcessNumber::new("p-1").unwrap())
            .await
            .unwrap();
        assert_eq!(got.documents.len(), 1);

        let missing = upstream
            .fetch_process(&ProcessNumber::new("p-2").unwrap())
            .await;
        assert!(matches!(missing, Err(UpstreamError::Status { code: 404 })));
    }

    #[tokio::test]
    async fn bounded_failures_then_success() {
        let upstream = InMemoryUpstreamClient::new();
        upstream.register_document(
            "handle-1",
            DocumentPayload {
                bytes: vec![1],
                content_type: None,
            },
        );
        upstream.fail_document("handle-1", UpstreamError::Status { code: 500 }, Some(2));

        assert!(upstream.fetch_document("handle-1").await.is_err());
        assert!(upstream.fetch_document("handle-1").await.is_err());
        assert!(upstream.fetch_document("handle-1").await.is_ok());
        assert_eq!(upstream.fetch_count("handle-1"), 3);
    }

    #[tokio::test]
    async fn persistent_failures_never_clear() {
        let upstream = InMemoryUpstreamClient::new();
        upstream.fail_document("handle-1", UpstreamError::Timeout, None);
        for _ in 0..5 {
            assert!(matches!(
                upstream.fetch_document("handle-1").await,
                Err(UpstreamError::Timeout)
            ));
        }
    }
}
