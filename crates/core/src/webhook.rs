//! Webhook URL policy.
//!
//! Validated twice: by the scheduler at admission and by the dispatcher right
//! before sending, so a URL that slipped into storage through another path
//! still cannot be called.

use url::Url;

use crate::error::{DomainError, DomainResult};

/// Ports never acceptable as webhook targets.
const BLOCKED_PORTS: [u16; 3] = [22, 23, 3389];

/// Hosts for which plain http is tolerated even when the policy requires TLS.
const LOOPBACK_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Validate a caller-supplied webhook URL.
///
/// `require_https` reflects the deployment environment: in production, http
/// is only allowed toward loopback hosts; development deployments accept
/// plain http anywhere.
pub fn validate_webhook_url(raw: &str, require_https: bool) -> DomainResult<()> {
    if raw.is_empty() {
        return Err(DomainError::validation("webhook URL must be non-empty"));
    }

    let url = Url::parse(raw)
        .map_err(|e| DomainError::validation(format!("webhook URL is not absolute: {}", e)))?;

    match url.scheme() {
        "https" => {}
        "http" => {
            let host = url.host_str().unwrap_or("");
            if require_https && !LOOPBACK_HOSTS.contains(&host) {
                return Err(DomainError::validation(
                    "plain http webhooks are only allowed toward localhost",
                ));
            }
        }
        other => {
            return Err(DomainError::validation(format!(
                "webhook URL scheme must be http or https, got {}",
                other
            )));
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(DomainError::validation("webhook URL has no host"));
    }

    if let Some(port) = url.port() {
        if BLOCKED_PORTS.contains(&port) {
            return Err(DomainError::validation(format!(
                "port {} is not allowed for webhooks",
                port
            )));
        }
    }

    Ok(())
}
