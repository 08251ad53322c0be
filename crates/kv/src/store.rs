//! Uniform facade over the external keyed coordination service.
//!
//! Every coordination primitive in the system (cache election, idempotency
//! records, chat session memory, the durable queue, order status) goes
//! through this trait, so coordination logic can be tested against the
//! in-memory implementation and deployed against redis unchanged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KvError;

/// Proof of lock ownership. Release is a no-op when the stored token no
/// longer matches (the lock expired and was re-acquired by someone else).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait KeyedStore: Send + Sync {
    // ── Strings ──────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Atomic set-if-absent with TTL. Returns true when this caller created
    /// the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    // ── Lists ────────────────────────────────────────────────

    /// Inclusive range; negative indices count from the tail, redis-style.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Atomically replace the list at `key` with `values` and set its TTL
    /// (pipelined DEL + RPUSH + EXPIRE transaction).
    async fn replace_list(&self, key: &str, values: &[String], ttl: Duration)
        -> Result<(), KvError>;

    /// Pop from the tail of `source` and park onto the head of `dest`.
    async fn rpoplpush(&self, source: &str, dest: &str) -> Result<Option<String>, KvError>;

    /// Remove up to `count` occurrences of `value`; returns how many were
    /// removed.
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<u64, KvError>;

    async fn llen(&self, key: &str) -> Result<u64, KvError>;

    // ── Hashes ───────────────────────────────────────────────

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    // ── Sets ─────────────────────────────────────────────────

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    // ── Locks ────────────────────────────────────────────────

    /// Non-blocking mutex acquire: SETNX of a random token under `key` with
    /// `ttl`. `None` means somebody else holds the lock.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, KvError>;

    /// Compare-and-delete release. Silently succeeds when the token no
    /// longer matches.
    async fn release_lock(&self, token: &LockToken) -> Result<(), KvError>;

    // ── Pub/sub ──────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;

    /// Subscribe to a channel; messages arrive on the returned receiver
    /// until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, KvError>;
}
