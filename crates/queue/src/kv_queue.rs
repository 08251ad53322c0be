//! Durable queue on top of the keyed store's list primitives.
//!
//! Layout per queue `Q`:
//! - `Q`          — the queue proper; publish is LPUSH, consume pops the tail
//!                  (FIFO).
//! - `Q:pending`  — parked in-flight envelopes, moved there atomically by
//!                  RPOPLPUSH on consume and removed by LREM on ack.
//!
//! A message that is consumed but never acked stays parked; the redelivery
//! sweep pushes envelopes older than a threshold back onto `Q`, which is
//! what makes delivery at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use medpulse_kv::KeyedStore;

use crate::consumer::{QueueConsumer, QueueMessage, QueuePublisher};
use crate::error::QueueError;

/// Wire envelope stored on the queue lists. The serialized envelope string
/// doubles as the receipt handle, so ack can LREM exactly this message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    enqueued_at: DateTime<Utc>,
    payload: String,
}

pub struct KvQueue {
    store: Arc<dyn KeyedStore>,
    publish_timeout: Duration,
}

impl KvQueue {
    pub fn new(store: Arc<dyn KeyedStore>, publish_timeout: Duration) -> Self {
        Self {
            store,
            publish_timeout,
        }
    }

    fn pending_key(queue: &str) -> String {
        format!("{queue}:pending")
    }
}

#[async_trait]
impl QueuePublisher for KvQueue {
    async fn publish(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            payload: body.to_string(),
        };
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| QueueError::Parse(e.to_string()))?;

        let push = self.store.lpush(queue, &raw);
        match tokio::time::timeout(self.publish_timeout, push).await {
            Ok(result) => {
                result?;
                debug!(queue = %queue, id = %envelope.id, "message published");
                Ok(())
            }
            Err(_) => Err(QueueError::PublishTimeout(
                self.publish_timeout.as_millis() as u64,
            )),
        }
    }
}

#[async_trait]
impl QueueConsumer for KvQueue {
    async fn poll(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError> {
        let pending = Self::pending_key(queue);
        let Some(raw) = self.store.rpoplpush(queue, &pending).await? else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                // A corrupt frame would otherwise be redelivered forever;
                // drop it from the pending list and surface the error.
                warn!(queue = %queue, error = %e, "dropping unparseable queue frame");
                let _ = self.store.lrem(&pending, 1, &raw).await;
                return Err(QueueError::Parse(e.to_string()));
            }
        };

        Ok(Some(QueueMessage {
            id: envelope.id,
            body: envelope.payload,
            receipt_handle: raw,
            enqueued_at: envelope.enqueued_at,
        }))
    }

    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let removed = self
            .store
            .lrem(&Self::pending_key(queue), 1, receipt_handle)
            .await?;
        if removed == 0 {
            // Already redelivered (and possibly re-acked) — not an error for
            // an at-least-once queue, but worth noticing.
            debug!(queue = %queue, "ack found no parked message");
        }
        Ok(())
    }

    async fn redeliver_pending(&self, queue: &str, min_age_secs: i64) -> Result<u64, QueueError> {
        let pending = Self::pending_key(queue);
        let parked = self.store.lrange(&pending, 0, -1).await?;
        let now = Utc::now();
        let mut redelivered = 0u64;

        for raw in parked {
            let Ok(envelope) = serde_json::from_str::<Envelope>(&raw) else {
                warn!(queue = %queue, "purging unparseable parked frame");
                let _ = self.store.lrem(&pending, 1, &raw).await;
                continue;
            };
            if (now - envelope.enqueued_at).num_seconds() < min_age_secs {
                continue;
            }
            // Remove-then-requeue: if another worker acks concurrently the
            // LREM comes back 0 and we skip the requeue, so the message is
            // not duplicated by the sweep itself.
            if self.store.lrem(&pending, 1, &raw).await? > 0 {
                self.store.lpush(queue, &raw).await?;
                redelivered += 1;
            }
        }

        if redelivered > 0 {
            warn!(queue = %queue, count = redelivered, "redelivered un-acked messages");
        }
        Ok(redelivered)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.store.llen(queue).await?)
    }
}

#[cfg(test)]
mod tests {
    use medpulse_kv::MemoryStore;

    use super::*;

    fn queue() -> KvQueue {
        KvQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn publish_then_poll_is_fifo() {
        let q = queue();
        q.publish("behavior", "first").await.unwrap();
        q.publish("behavior", "second").await.unwrap();

        let m1 = q.poll("behavior").await.unwrap().unwrap();
        let m2 = q.poll("behavior").await.unwrap().unwrap();
        assert_eq!(m1.body, "first");
        assert_eq!(m2.body, "second");
        assert!(q.poll("behavior").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_parked_message() {
        let q = queue();
        q.publish("behavior", "payload").await.unwrap();

        let msg = q.poll("behavior").await.unwrap().unwrap();
        q.ack("behavior", &msg.receipt_handle).await.unwrap();

        // Nothing parked, nothing to redeliver.
        assert_eq!(q.redeliver_pending("behavior", 0).await.unwrap(), 0);
        assert!(q.poll("behavior").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered() {
        let q = queue();
        q.publish("behavior", "payload").await.unwrap();

        let first = q.poll("behavior").await.unwrap().unwrap();
        // Consumer crashes: no ack.
        assert_eq!(q.redeliver_pending("behavior", 0).await.unwrap(), 1);

        let again = q.poll("behavior").await.unwrap().unwrap();
        assert_eq!(again.body, "payload");
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn young_pending_messages_not_redelivered() {
        let q = queue();
        q.publish("behavior", "payload").await.unwrap();
        let _ = q.poll("behavior").await.unwrap().unwrap();

        // Still within the grace period.
        assert_eq!(q.redeliver_pending("behavior", 3600).await.unwrap(), 0);
        assert!(q.poll("behavior").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn depth_counts_waiting_messages() {
        let q = queue();
        assert_eq!(q.depth("behavior").await.unwrap(), 0);
        q.publish("behavior", "a").await.unwrap();
        q.publish("behavior", "b").await.unwrap();
        assert_eq!(q.depth("behavior").await.unwrap(), 2);
        let _ = q.poll("behavior").await.unwrap();
        assert_eq!(q.depth("behavior").await.unwrap(), 1);
    }
}
