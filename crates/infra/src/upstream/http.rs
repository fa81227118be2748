//! HTTP implementation of the upstream portal client.

use std::time::Duration;

use serde::Deserialize;
use tracing::instrument;

use docket_core::{DocumentId, ProcessNumber};

use super::{DocumentListing, DocumentPayload, ProcessMetadata, UpstreamClient, UpstreamError};

/// Wire shape of the portal's process endpoint. The full body is also kept
/// verbatim as the opaque summary.
#[derive(Debug, Deserialize)]
struct ProcessBody {
    #[serde(default)]
    court: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    documents: Vec<DocumentBody>,
}

#[derive(Debug, Deserialize)]
struct DocumentBody {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    href: String,
}

pub struct HttpUpstreamClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpUpstreamClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Handles are absolute in practice; relative ones resolve against the
    /// portal base.
    fn resolve_handle(&self, source_handle: &str) -> String {
        if source_handle.starts_with("http://") || source_handle.starts_with("https://") {
            source_handle.to_string()
        } else {
            format!("{}/{}", self.base_url, source_handle.trim_start_matches('/'))
        }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout
    } else if error.is_connect() {
        UpstreamError::Connect(error.to_string())
    } else if error.is_decode() {
        UpstreamError::Decode(error.to_string())
    } else {
        UpstreamError::Other(error.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(UpstreamError::Status {
            code: status.as_u16(),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
    #[instrument(skip(self), fields(process_number = %process_number), err)]
    async fn fetch_process(
        &self,
        process_number: &ProcessNumber,
    ) -> Result<ProcessMetadata, UpstreamError> {
        let url = format!("{}/processes/{}", self.base_url, process_number);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response)?;

        let summary: serde_json::Value = response.json().await.map_err(map_reqwest_error)?;
        let body: ProcessBody = serde_json::from_value(summary.clone())
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let documents = body
            .documents
            .into_iter()
            .map(|d| {
                Ok(DocumentListing {
                    document_id: DocumentId::new(d.id)
                        .map_err(|e| UpstreamError::Decode(e.to_string()))?,
                    name: d.name,
                    mime_type: d.mime_type,
                    source_handle: d.href,
                })
            })
            .collect::<Result<Vec<_>, UpstreamError>>()?;

        Ok(ProcessMetadata {
            process_number: process_number.clone(),
            court: body.court,
            subject: body.subject,
            summary,
            documents,
        })
    }

    #[instrument(skip(self), err)]
    async fn fetch_document(
        &self,
        source_handle: &str,
    ) -> Result<DocumentPayload, UpstreamError> {
        let url = self.resolve_handle(source_handle);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if bytes.is_empty() {
            return Err(UpstreamError::Decode("empty document body".to_string()));
        }

        Ok(DocumentPayload {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_handles_against_base() {
        let client =
            HttpUpstreamClient::new("https://portal.example/api/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.resolve_handle("/documents/d-1/binary"),
            "https://portal.example/api/documents/d-1/binary"
        );
        assert_eq!(
            client.resolve_handle("https://cdn.example/d-1"),
            "https://cdn.example/d-1"
        );
    }
}
