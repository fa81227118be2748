//! In-memory broker for dev/test.
//!
//! FIFO queue plus an in-flight map. A dequeued ticket moves to in-flight
//! with a deadline; if it is not acknowledged before the deadline, the next
//! dequeue returns it again (at-least-once, like a stream consumer group
//! reclaiming stale pending entries).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{BrokerError, Delivery, Ticket, WorkBroker};

#[derive(Debug)]
struct InFlight {
    ticket: Ticket,
    deadline: Instant,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<(Ticket, u32)>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Test/dev introspection: tickets waiting plus tickets in flight.
    pub fn depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.queue.len() + state.in_flight.len()
    }

    fn reclaim_expired(state: &mut State, now: Instant) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(entry) = state.in_flight.remove(&receipt) {
                state.queue.push_back((entry.ticket, entry.attempt));
            }
        }
    }

    fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock().unwrap();
        Self::reclaim_expired(&mut state, Instant::now());
        let (ticket, prior_attempts) = state.queue.pop_front()?;
        let receipt = Uuid::now_v7().to_string();
        let attempt = prior_attempts + 1;
        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                ticket,
                deadline: Instant::now() + self.visibility_timeout,
                attempt,
            },
        );
        Some(Delivery {
            ticket,
            receipt,
            attempt,
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl WorkBroker for InMemoryBroker {
    async fn enqueue(&self, ticket: Ticket) -> Result<(), BrokerError> {
        self.state.lock().unwrap().queue.push_back((ticket, 0));
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_pop() {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake on enqueue, on the next visibility deadline, or when the
            // caller's wait expires, whichever comes first.
            let next_reclaim = self
                .state
                .lock()
                .unwrap()
                .in_flight
                .values()
                .map(|f| f.deadline)
                .min();
            let wake_at = next_reclaim.map_or(deadline, |r| r.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.state.lock().unwrap().in_flight.remove(&delivery.receipt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::JobId;

    fn ticket() -> Ticket {
        Ticket { job_id: JobId::new() }
    }

    #[tokio::test]
    async fn fifo_order() {
        let broker = InMemoryBroker::default();
        let first = ticket();
        let second = ticket();
        broker.enqueue(first).await.unwrap();
        broker.enqueue(second).await.unwrap();

        let a = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(a.ticket, first);
        assert_eq!(b.ticket, second);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let broker = InMemoryBroker::default();
        let got = broker.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn acked_tickets_are_gone() {
        let broker = InMemoryBroker::new(Duration::from_millis(10));
        broker.enqueue(ticket()).await.unwrap();

        let delivery = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        broker.ack(&delivery).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(broker.depth(), 0);
    }

    #[tokio::test]
    async fn unacked_tickets_are_redelivered() {
        let broker = InMemoryBroker::new(Duration::from_millis(20));
        let t = ticket();
        broker.enqueue(t).await.unwrap();

        let first = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        // Never acked; wait past the visibility timeout.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.ticket, t);
        assert_eq!(second.attempt, 2);
        assert_ne!(first.receipt, second.receipt);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(InMemoryBroker::default());
        let t = ticket();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.enqueue(t).await.unwrap();

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.ticket, t);
    }
}
