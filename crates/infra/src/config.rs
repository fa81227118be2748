//! Runtime configuration.
//!
//! Every tunable the pipeline exposes lives here, read from `DOCKET_*`
//! environment variables with coded defaults. Components receive the parts
//! they need explicitly; nothing reads the environment after startup.

use std::time::Duration;

/// Deployment environment; controls the webhook http/https rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    /// Address the HTTP ingress binds to.
    pub bind_addr: String,

    /// Number of worker tasks consuming the broker.
    pub worker_count: usize,
    /// Documents processed concurrently within one job (batch size B).
    pub batch_size: usize,
    /// Attempts per document (R).
    pub document_attempts: u32,
    /// Exponential backoff base between document attempts.
    pub document_backoff: Duration,

    /// Base URL of the upstream portal.
    pub upstream_base_url: String,
    /// Bearer token for the upstream portal, if required.
    pub upstream_token: Option<String>,
    /// Per-request timeout for upstream fetches.
    pub upstream_timeout: Duration,

    /// Attempts per webhook delivery (W).
    pub webhook_attempts: u32,
    /// Exponential backoff base between webhook attempts.
    pub webhook_backoff: Duration,
    /// Per-attempt timeout for webhook POSTs.
    pub webhook_timeout: Duration,

    /// Time-to-live of pre-signed read URLs.
    pub presign_ttl: Duration,
    /// How long a dequeued ticket stays invisible before redelivery.
    pub broker_visibility_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_count: 2,
            batch_size: 5,
            document_attempts: 3,
            document_backoff: Duration::from_secs(2),
            upstream_base_url: "http://localhost:9090".to_string(),
            upstream_token: None,
            upstream_timeout: Duration::from_secs(60),
            webhook_attempts: 3,
            webhook_backoff: Duration::from_secs(2),
            webhook_timeout: Duration::from_secs(30),
            presign_ttl: Duration::from_secs(3600),
            broker_visibility_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from `DOCKET_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            environment: match std::env::var("DOCKET_ENV").as_deref() {
                Ok("production") => Environment::Production,
                _ => Environment::Development,
            },
            bind_addr: env_string("DOCKET_BIND_ADDR", defaults.bind_addr),
            worker_count: env_parse("DOCKET_WORKER_COUNT", defaults.worker_count),
            batch_size: env_parse("DOCKET_BATCH_SIZE", defaults.batch_size).max(1),
            document_attempts: env_parse("DOCKET_DOCUMENT_ATTEMPTS", defaults.document_attempts)
                .max(1),
            document_backoff: env_secs("DOCKET_DOCUMENT_BACKOFF_SECS", defaults.document_backoff),
            upstream_base_url: env_string("DOCKET_UPSTREAM_URL", defaults.upstream_base_url),
            upstream_token: std::env::var("DOCKET_UPSTREAM_TOKEN").ok(),
            upstream_timeout: env_secs("DOCKET_UPSTREAM_TIMEOUT_SECS", defaults.upstream_timeout),
            webhook_attempts: env_parse("DOCKET_WEBHOOK_ATTEMPTS", defaults.webhook_attempts)
                .max(1),
            webhook_backoff: env_secs("DOCKET_WEBHOOK_BACKOFF_SECS", defaults.webhook_backoff),
            webhook_timeout: env_secs("DOCKET_WEBHOOK_TIMEOUT_SECS", defaults.webhook_timeout),
            presign_ttl: env_secs("DOCKET_PRESIGN_TTL_SECS", defaults.presign_ttl),
            broker_visibility_timeout: env_secs(
                "DOCKET_BROKER_VISIBILITY_SECS",
                defaults.broker_visibility_timeout,
            ),
        }
    }

    /// Production requires https webhooks (loopback excepted).
    pub fn require_https_webhooks(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let config = Config::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.document_attempts, 3);
        assert_eq!(config.document_backoff, Duration::from_secs(2));
        assert_eq!(config.webhook_attempts, 3);
        assert_eq!(config.webhook_timeout, Duration::from_secs(30));
        assert_eq!(config.upstream_timeout, Duration::from_secs(60));
        assert_eq!(config.presign_ttl, Duration::from_secs(3600));
        assert!(!config.require_https_webhooks());
    }
}
