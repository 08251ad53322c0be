//! In-memory [`KeyedStore`] for unit tests and local development.
//!
//! Single-process only. TTLs are checked lazily on access, which is enough
//! for the coordination logic exercised in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::KvError;
use crate::store::{KeyedStore, LockToken};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(Vec<String>),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&Value) -> T) -> Option<T> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live() => Some(f(&entry.value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn modify<T>(&self, key: &str, default: Value, f: impl FnOnce(&mut Value) -> T) -> T {
        let mut entries = self.entries.lock().unwrap();
        let stale = entries.get(key).map_or(false, |e| !e.live());
        if stale {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: default,
            expires_at: None,
        });
        f(&mut entry.value)
    }
}

/// Redis-style inclusive range over a list of `len` items.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .read(key, |v| match v {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            })
            .flatten())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.insert(key, Value::Str(value.to_string()), ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map_or(false, |e| e.live()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        Ok(self
            .read(key, |v| match v {
                Value::List(items) => resolve_range(items.len(), start, stop)
                    .map(|(a, b)| items[a..=b].to_vec())
                    .unwrap_or_default(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError> {
        if values.is_empty() {
            return Ok(());
        }
        self.modify(key, Value::List(Vec::new()), |v| {
            if let Value::List(items) = v {
                items.extend(values.iter().cloned());
            }
        });
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.modify(key, Value::List(Vec::new()), |v| {
            if let Value::List(items) = v {
                items.insert(0, value.to_string());
            }
        });
        Ok(())
    }

    async fn replace_list(
        &self,
        key: &str,
        values: &[String],
        ttl: Duration,
    ) -> Result<(), KvError> {
        if values.is_empty() {
            self.entries.lock().unwrap().remove(key);
        } else {
            self.insert(key, Value::List(values.to_vec()), Some(ttl));
        }
        Ok(())
    }

    async fn rpoplpush(&self, source: &str, dest: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().unwrap();
        let popped = match entries.get_mut(source) {
            Some(entry) if entry.live() => match &mut entry.value {
                Value::List(items) => items.pop(),
                _ => None,
            },
            _ => None,
        };
        if let Some(value) = &popped {
            let dest_entry = entries.entry(dest.to_string()).or_insert(Entry {
                value: Value::List(Vec::new()),
                expires_at: None,
            });
            if let Value::List(items) = &mut dest_entry.value {
                items.insert(0, value.clone());
            }
        }
        Ok(popped)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<u64, KvError> {
        Ok(self.modify(key, Value::List(Vec::new()), |v| {
            let Value::List(items) = v else { return 0 };
            let mut removed = 0u64;
            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() };
            // count >= 0 removes head-to-tail, negative removes tail-to-head.
            if count >= 0 {
                let mut i = 0;
                while i < items.len() && removed < limit as u64 {
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = items.len();
                while i > 0 && removed < limit as u64 {
                    i -= 1;
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    }
                }
            }
            removed
        }))
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        Ok(self
            .read(key, |v| match v {
                Value::List(items) => items.len() as u64,
                _ => 0,
            })
            .unwrap_or(0))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        self.modify(key, Value::Hash(HashMap::new()), |v| {
            if let Value::Hash(map) = v {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
            }
        });
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        Ok(self
            .read(key, |v| match v {
                Value::Hash(map) => map.clone(),
                _ => HashMap::new(),
            })
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        self.modify(key, Value::Set(BTreeSet::new()), |v| {
            if let Value::Set(set) = v {
                set.insert(member.to_string());
            }
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .read(key, |v| match v {
                Value::Set(set) => set.iter().cloned().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, KvError> {
        let token = Uuid::new_v4().to_string();
        if self.set_nx(key, &token, ttl).await? {
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    async fn release_lock(&self, token: &LockToken) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap();
        let matches = entries.get(&token.key).map_or(false, |e| {
            e.live() && matches!(&e.value, Value::Str(s) if *s == token.token)
        });
        if matches {
            entries.remove(&token.key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(channel) {
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, KvError> {
        let mut broadcast_rx = {
            let mut channels = self.channels.lock().unwrap();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(msg) = broadcast_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_nx("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_key_treated_as_absent() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // And set_nx can claim it again.
        assert!(store
            .set_nx("k", "w", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lrange_negative_indices() {
        let store = MemoryStore::new();
        let values: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        store.rpush("list", &values).await.unwrap();
        assert_eq!(
            store.lrange("list", -2, -1).await.unwrap(),
            vec!["4".to_string(), "5".to_string()]
        );
        assert_eq!(store.lrange("list", 0, -1).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn replace_list_swaps_contents() {
        let store = MemoryStore::new();
        store
            .rpush("list", &["old".to_string()])
            .await
            .unwrap();
        store
            .replace_list(
                "list",
                &["a".to_string(), "b".to_string()],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(
            store.lrange("list", 0, -1).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn rpoplpush_moves_tail_to_pending() {
        let store = MemoryStore::new();
        store
            .rpush("q", &["m1".to_string(), "m2".to_string()])
            .await
            .unwrap();
        // lpush-published queues pop from the tail: FIFO.
        let popped = store.rpoplpush("q", "q:pending").await.unwrap();
        assert_eq!(popped.as_deref(), Some("m2"));
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.llen("q:pending").await.unwrap(), 1);
        assert_eq!(store.lrem("q:pending", 1, "m2").await.unwrap(), 1);
        assert_eq!(store.llen("q:pending").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_release_is_noop_after_takeover() {
        let store = MemoryStore::new();
        let stale = store
            .acquire_lock("lock", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Lock expired; a second worker takes it over.
        let fresh = store
            .acquire_lock("lock", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        // Releasing with the stale token must not free the new holder's lock.
        store.release_lock(&stale).await.unwrap();
        assert_eq!(
            store.get("lock").await.unwrap().as_deref(),
            Some(fresh.token.as_str())
        );

        store.release_lock(&fresh).await.unwrap();
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_and_set_ops() {
        let store = MemoryStore::new();
        store
            .hset(
                "h",
                &[
                    ("last_message".to_string(), "hi".to_string()),
                    ("session_id".to_string(), "s1".to_string()),
                ],
            )
            .await
            .unwrap();
        let map = store.hgetall("h").await.unwrap();
        assert_eq!(map.get("last_message").map(String::as_str), Some("hi"));

        store.sadd("s", "s1").await.unwrap();
        store.sadd("s", "s1").await.unwrap();
        store.sadd("s", "s2").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();
        store.publish("events", "ping").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(msg.as_deref(), Some("ping"));
    }
}
