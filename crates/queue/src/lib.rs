pub mod consumer;
pub mod error;
pub mod kv_queue;

pub use consumer::{QueueConsumer, QueueMessage, QueuePublisher};
pub use error::QueueError;
pub use kv_queue::KvQueue;
