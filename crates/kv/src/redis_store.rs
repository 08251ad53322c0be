//! Redis-backed [`KeyedStore`] over a multiplexed connection manager.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::KvError;
use crate::store::{KeyedStore, LockToken};

/// Lua guard: delete the lock key only while it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect and ping. Fails fast so startup can refuse to serve without
    /// its coordination backbone.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let mut manager = ConnectionManager::new(client.clone()).await?;

        let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
        debug!(pong = %pong, "redis connected");

        Ok(Self {
            client,
            manager,
            op_timeout,
        })
    }

    /// Apply the per-operation deadline shared by every facade call.
    async fn deadline<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                self.deadline(async move { conn.set_ex(key, value, secs).await })
                    .await
            }
            None => self.deadline(async move { conn.set(key, value).await }).await,
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        let reply: Option<String> = self
            .deadline(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.del(key).await }).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.lrange(key, start, stop).await })
            .await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let values = values.to_vec();
        self.deadline(async move { conn.rpush(key, values).await })
            .await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.lpush(key, value).await })
            .await
    }

    async fn replace_list(
        &self,
        key: &str,
        values: &[String],
        ttl: Duration,
    ) -> Result<(), KvError> {
        let mut conn = self.conn();
        let values = values.to_vec();
        let secs = ttl.as_secs().max(1) as i64;
        self.deadline(async move {
            let mut pipe = redis::pipe();
            pipe.atomic().del(key).ignore();
            if !values.is_empty() {
                pipe.rpush(key, values).ignore();
                pipe.expire(key, secs).ignore();
            }
            pipe.query_async(&mut conn).await
        })
        .await
    }

    async fn rpoplpush(&self, source: &str, dest: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("RPOPLPUSH")
                .arg(source)
                .arg(dest)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .deadline(async move { conn.lrem(key, count, value).await })
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        let len: i64 = self.deadline(async move { conn.llen(key).await }).await?;
        Ok(len.max(0) as u64)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let fields = fields.to_vec();
        self.deadline(async move { conn.hset_multiple(key, &fields).await })
            .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.hgetall(key).await }).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.sadd(key, member).await })
            .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.smembers(key).await }).await
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
        let mut conn = self.conn();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let key = token.key.clone();
        let value = token.token.clone();
        let released: i64 = self
            .deadline(async move {
                script
                    .key(key)
                    .arg(value)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        if released == 0 {
            // Token mismatch: the lock expired and was taken over. Nothing
            // to do — deleting it now would steal the new holder's lock.
            debug!(key = %token.key, "lock token no longer current, release skipped");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        self.deadline(async move { conn.publish(channel, payload).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, KvError> {
        use futures::StreamExt;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| KvError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| KvError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "dropping undecodable pubsub message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
