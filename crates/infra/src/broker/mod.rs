//! Work broker seam: FIFO job-ticket queue with at-least-once delivery.
//!
//! Tickets carry only the job id; the job record is re-read from the
//! metadata store on claim, so a redelivered ticket can never smuggle stale
//! state. Consumers must acknowledge; unacknowledged deliveries come back
//! after a visibility timeout, and the worker's Pending-claim guard makes the
//! redelivery harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docket_core::JobId;

mod memory;
#[cfg(feature = "persistent")]
mod redis_streams;

pub use memory::InMemoryBroker;
#[cfg(feature = "persistent")]
pub use redis_streams::RedisStreamsBroker;

/// The broker message: a job id and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub job_id: JobId,
}

/// One delivery of a ticket to one consumer. The receipt identifies the
/// delivery for acknowledgement; `attempt` counts redeliveries.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub ticket: Ticket,
    pub receipt: String,
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("ticket serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait WorkBroker: Send + Sync {
    async fn enqueue(&self, ticket: Ticket) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next ticket. Returns `None` on timeout.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery, removing it from redelivery.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> WorkBroker for Arc<B>
where
    B: WorkBroker + ?Sized,
{
    async fn enqueue(&self, ticket: Ticket) -> Result<(), BrokerError> {
        (**self).enqueue(ticket).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).dequeue(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }
}
