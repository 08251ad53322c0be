//! Queue publisher/consumer traits and message types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A message received from a durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier assigned at publish time.
    pub id: String,
    /// Raw message payload (JSON string, UTF-8).
    pub body: String,
    /// Opaque handle for manual acknowledgement.
    pub receipt_handle: String,
    /// When the message was published.
    pub enqueued_at: DateTime<Utc>,
}

/// Publishing side of a durable queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Append one persistent message. Completes only once the queue has
    /// durably accepted it.
    async fn publish(&self, queue: &str, body: &str) -> Result<(), QueueError>;
}

/// Consuming side of a durable queue with manual acknowledgement.
///
/// Delivery is at-least-once: a message stays parked on a pending list from
/// poll until [`ack`](QueueConsumer::ack); un-acked messages are returned to
/// the queue by [`redeliver_pending`](QueueConsumer::redeliver_pending).
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Pop the oldest available message, or `None` when the queue is empty.
    /// Never blocks past the store's own deadline.
    async fn poll(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledge successful processing — removes the parked message.
    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Return parked messages older than `min_age_secs` to the queue for
    /// redelivery. Returns how many were re-queued.
    async fn redeliver_pending(&self, queue: &str, min_age_secs: i64) -> Result<u64, QueueError>;

    /// Approximate number of messages waiting in the queue.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;
}
