//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Stream key**: `docket:tickets` (XADD on enqueue)
//! - **Consumer group**: one shared group for the worker pool; each consumer
//!   gets a unique name, so a ticket is delivered to exactly one live worker
//! - **Redelivery**: XAUTOCLAIM moves pending entries idle past the
//!   visibility timeout to the calling consumer
//! - **Ack**: XACK after the worker commits the job's terminal state

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{BrokerError, Delivery, Ticket, WorkBroker};

const DEFAULT_STREAM_KEY: &str = "docket:tickets";
const DEFAULT_GROUP: &str = "docket:workers";

/// How often the dequeue loop polls the stream when it is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct RedisStreamsBroker {
    connection: Mutex<ConnectionManager>,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl RedisStreamsBroker {
    /// Connect and ensure the consumer group exists (idempotent).
    pub async fn connect(
        redis_url: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let mut connection = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        // XGROUP CREATE with MKSTREAM creates the stream on first use; an
        // already-exists error is fine.
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(DEFAULT_STREAM_KEY)
            .arg(DEFAULT_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut connection)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(BrokerError::Command(format!("XGROUP CREATE failed: {e}")));
            }
        }

        Ok(Self {
            connection: Mutex::new(connection),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            visibility_timeout,
        })
    }

    fn parse_entry(id: &str, fields: &[(String, String)]) -> Result<Delivery, BrokerError> {
        let payload = fields
            .iter()
            .find(|(name, _)| name == "ticket")
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| {
                BrokerError::Serialization(format!("entry {id} has no ticket field"))
            })?;
        let ticket: Ticket = serde_json::from_str(payload)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        Ok(Delivery {
            ticket,
            receipt: id.to_string(),
            attempt: 1,
        })
    }

    /// Claim one entry pending longer than the visibility timeout, if any.
    async fn reclaim_one(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut connection = self.connection.lock().await;
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut *connection)
            .await
            .map_err(|e| BrokerError::Command(format!("XAUTOCLAIM failed: {e}")))?;
        drop(connection);

        let entries = parse_stream_entries(&reply)?;
        match entries.into_iter().next() {
            Some((id, fields)) => {
                let mut delivery = Self::parse_entry(&id, &fields)?;
                // Redelivery: the original consumer never acked.
                delivery.attempt = 2;
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }

    async fn read_new(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut connection = self.connection.lock().await;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut *connection)
            .await
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {e}")))?;
        drop(connection);

        let entries = parse_xread_reply(&reply)?;
        match entries.into_iter().next() {
            Some((id, fields)) => Self::parse_entry(&id, &fields).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorkBroker for RedisStreamsBroker {
    async fn enqueue(&self, ticket: Ticket) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&ticket)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut connection = self.connection.lock().await;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("ticket")
            .arg(payload)
            .query_async(&mut *connection)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Stale pending entries first, then fresh ones.
            match self.reclaim_one().await {
                Ok(Some(delivery)) => {
                    warn!(
                        receipt = %delivery.receipt,
                        "reclaimed unacknowledged ticket"
                    );
                    return Ok(Some(delivery));
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
            if let Some(delivery) = self.read_new().await? {
                return Ok(Some(delivery));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut connection = self.connection.lock().await;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut *connection)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

/// Pull `(id, field pairs)` tuples out of an XAUTOCLAIM reply
/// (`[next-cursor, [[id, [k, v, ...]], ...], deleted]`).
fn parse_stream_entries(
    reply: &redis::Value,
) -> Result<Vec<(String, Vec<(String, String)>)>, BrokerError> {
    let redis::Value::Array(items) = reply else {
        return Ok(Vec::new());
    };
    match items.get(1) {
        Some(entries) => parse_entry_list(entries),
        None => Ok(Vec::new()),
    }
}

/// Pull entries out of an XREADGROUP reply
/// (`[[stream-key, [[id, [k, v, ...]], ...]]]` or nil when empty).
fn parse_xread_reply(
    reply: &redis::Value,
) -> Result<Vec<(String, Vec<(String, String)>)>, BrokerError> {
    let redis::Value::Array(streams) = reply else {
        return Ok(Vec::new());
    };
    let Some(redis::Value::Array(stream)) = streams.first() else {
        return Ok(Vec::new());
    };
    match stream.get(1) {
        Some(entries) => parse_entry_list(entries),
        None => Ok(Vec::new()),
    }
}

fn parse_entry_list(
    value: &redis::Value,
) -> Result<Vec<(String, Vec<(String, String)>)>, BrokerError> {
    let redis::Value::Array(entries) = value else {
        return Ok(Vec::new());
    };
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Array(parts) = entry else {
            continue;
        };
        let (Some(id), Some(redis::Value::Array(kv))) = (parts.first(), parts.get(1)) else {
            continue;
        };
        let id = value_to_string(id)?;
        let mut fields = Vec::with_capacity(kv.len() / 2);
        for pair in kv.chunks(2) {
            if let [name, value] = pair {
                fields.push((value_to_string(name)?, value_to_string(value)?));
            }
        }
        parsed.push((id, fields));
    }
    Ok(parsed)
}

fn value_to_string(value: &redis::Value) -> Result<String, BrokerError> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| BrokerError::Serialization(e.to_string())),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        other => Err(BrokerError::Serialization(format!(
            "unexpected redis value: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::JobId;

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> redis::Value {
        redis::Value::Array(vec![
            bulk(id),
            redis::Value::Array(vec![bulk("ticket"), bulk(payload)]),
        ])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let ticket = Ticket { job_id: JobId::new() };
        let payload = serde_json::to_string(&ticket).unwrap();
        let reply = redis::Value::Array(vec![redis::Value::Array(vec![
            bulk("docket:tickets"),
            redis::Value::Array(vec![entry("1719-0", &payload)]),
        ])]);

        let entries = parse_xread_reply(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        let delivery = RedisStreamsBroker::parse_entry(&entries[0].0, &entries[0].1).unwrap();
        assert_eq!(delivery.ticket, ticket);
        assert_eq!(delivery.receipt, "1719-0");
    }

    #[test]
    fn parses_empty_replies() {
        assert!(parse_xread_reply(&redis::Value::Nil).unwrap().is_empty());
        let empty_autoclaim = redis::Value::Array(vec![
            bulk("0-0"),
            redis::Value::Array(vec![]),
            redis::Value::Array(vec![]),
        ]);
        assert!(parse_stream_entries(&empty_autoclaim).unwrap().is_empty());
    }

    #[test]
    fn rejects_entries_without_ticket_field() {
        let malformed = vec![("other".to_string(), "x".to_string())];
        assert!(matches!(
            RedisStreamsBroker::parse_entry("1-0", &malformed),
            Err(BrokerError::Serialization(_))
        ));
    }
}
