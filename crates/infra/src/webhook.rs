//! Webhook delivery: bounded retry, strict 2xx success discipline.
//!
//! The dispatcher re-validates the URL policy right before sending, keeps TLS
//! verification on, and never follows redirects - a 3xx is a failed attempt
//! like any other non-2xx. It does not survive process restarts; callers
//! wanting durable redelivery re-enqueue explicitly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use docket_core::webhook::validate_webhook_url;
use docket_core::{DocumentStatus, JobId, JobStatus};

use crate::retry::RetryPolicy;

/// Callback payload, one per terminal job.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub process_number: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub total_documents: u32,
    pub completed_documents: u32,
    pub failed_documents: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents: Vec<WebhookDocument>,
}

/// Per-document record of the callback payload.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDocument {
    pub id: String,
    pub uuid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: DocumentStatus,
    /// Pre-signed read URL, present iff the document is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Failure category of the last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    Timeout,
    Connect(String),
    Tls(String),
    HttpStatus(u16),
    Other(String),
}

impl core::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeliveryFailure::Timeout => write!(f, "timeout"),
            DeliveryFailure::Connect(detail) => write!(f, "connection error: {detail}"),
            DeliveryFailure::Tls(detail) => write!(f, "TLS error: {detail}"),
            DeliveryFailure::HttpStatus(code) => write!(f, "HTTP {code}"),
            DeliveryFailure::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// Outcome of one delivery (all attempts included).
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub success: bool,
    pub attempts: u32,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Result of a connectivity probe (no payload).
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub reachable: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    require_https: bool,
}

impl WebhookDispatcher {
    pub fn new(
        attempts: u32,
        backoff_base: Duration,
        timeout: Duration,
        require_https: bool,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            retry: RetryPolicy::exponential(attempts, backoff_base),
            require_https,
        })
    }

    /// Deliver `payload` to `url`, retrying up to the attempt budget.
    /// Success means exactly one thing: some attempt saw a 2xx in time.
    #[instrument(skip(self, payload), fields(job_id = %job_id), err(Debug))]
    pub async fn deliver(
        &self,
        url: &str,
        payload: &WebhookPayload,
        job_id: JobId,
    ) -> Result<DeliveryReport, docket_core::DomainError> {
        validate_webhook_url(url, self.require_https)?;

        let mut last_failure: Option<DeliveryFailure> = None;
        let mut last_status: Option<u16> = None;

        for attempt in 1..=self.retry.max_attempts {
            match self.post_once(url, payload, job_id, attempt).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(attempt, status, "webhook delivered");
                    return Ok(DeliveryReport {
                        success: true,
                        attempts: attempt,
                        last_status: Some(status),
                        last_error: None,
                        sent_at: Some(Utc::now()),
                    });
                }
                Ok(status) => {
                    warn!(attempt, status, "webhook attempt rejected");
                    last_status = Some(status);
                    last_failure = Some(DeliveryFailure::HttpStatus(status));
                }
                Err(failure) => {
                    warn!(attempt, failure = %failure, "webhook attempt failed");
                    last_failure = Some(failure);
                }
            }

            if self.retry.has_next(attempt) {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        Ok(DeliveryReport {
            success: false,
            attempts: self.retry.max_attempts,
            last_status,
            last_error: last_failure.map(|f| f.to_string()),
            sent_at: None,
        })
    }

    async fn post_once(
        &self,
        url: &str,
        payload: &WebhookPayload,
        job_id: JobId,
        attempt: u32,
    ) -> Result<u16, DeliveryFailure> {
        let response = self
            .client
            .post(url)
            .header("User-Agent", "docket-webhook/1.0")
            .header("X-Webhook-Id", job_id.to_string())
            .header("X-Webhook-Timestamp", Utc::now().to_rfc3339())
            .header("X-Webhook-Attempt", attempt.to_string())
            .json(payload)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        Ok(response.status().as_u16())
    }

    /// Reachability probe for `POST /webhooks/test-connectivity`: HEAD first,
    /// falling back to GET for endpoints that reject HEAD outright.
    pub async fn probe(&self, url: &str) -> ProbeReport {
        if let Err(e) = validate_webhook_url(url, self.require_https) {
            return ProbeReport {
                reachable: false,
                status_code: None,
                error: Some(e.to_string()),
            };
        }

        match self.client.head(url).send().await {
            Ok(response) => ProbeReport {
                reachable: true,
                status_code: Some(response.status().as_u16()),
                error: None,
            },
            Err(_) => match self.client.get(url).send().await {
                Ok(response) => ProbeReport {
                    reachable: true,
                    status_code: Some(response.status().as_u16()),
                    error: None,
                },
                Err(e) => ProbeReport {
                    reachable: false,
                    status_code: None,
                    error: Some(classify_reqwest_error(e).to_string()),
                },
            },
        }
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        return DeliveryFailure::Timeout;
    }
    let detail = error.to_string();
    if detail.contains("certificate") || detail.contains("tls") || detail.contains("TLS") {
        return DeliveryFailure::Tls(detail);
    }
    if error.is_connect() {
        return DeliveryFailure::Connect(detail);
    }
    DeliveryFailure::Other(detail)
}
