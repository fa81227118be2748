//! Infrastructure layer: collaborator seams, the materialization pipeline,
//! and the read-side status projection.
//!
//! ## Components
//!
//! - `metadata_store`: transactional record storage (in-memory + Postgres)
//! - `blob_store`: binary object storage with pre-signed read URLs
//! - `upstream`: the court-portal client (HTTP + scripted in-memory)
//! - `broker`: at-least-once job ticket queue (in-memory + Redis Streams)
//! - `scheduler`: admission, idempotency, deduplication
//! - `worker`: per-job document pipeline with retry and backoff
//! - `webhook`: callback delivery with bounded retry and 2xx discipline
//! - `projection`: read-only `ProcessStatus` assembly

pub mod blob_store;
pub mod broker;
pub mod config;
pub mod metadata_store;
pub mod projection;
pub mod retry;
pub mod scheduler;
pub mod upstream;
pub mod webhook;
pub mod worker;

pub use blob_store::{BlobStore, BlobStoreError, InMemoryBlobStore};
pub use broker::{BrokerError, Delivery, InMemoryBroker, Ticket, WorkBroker};
pub use config::{Config, Environment};
pub use metadata_store::{InMemoryMetadataStore, MetadataStore, MetadataStoreError};
pub use projection::{ProcessStatus, StatusProjection};
pub use retry::RetryPolicy;
pub use scheduler::{Admission, Decision, Scheduler, SchedulerError};
pub use upstream::{InMemoryUpstreamClient, UpstreamClient, UpstreamError};
pub use webhook::{DeliveryReport, WebhookDispatcher};
pub use worker::DocumentWorker;
