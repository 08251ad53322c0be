//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] medpulse_kv::KvError),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("publish timed out after {0}ms")]
    PublishTimeout(u64),

    #[error("acknowledge error: {0}")]
    Ack(String),
}
