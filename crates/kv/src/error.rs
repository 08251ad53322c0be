//! Keyed store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("subscription error: {0}")]
    Subscribe(String),
}
