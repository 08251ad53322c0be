//! Stampede-protected read-through list cache.
//!
//! One caller per key is elected loader via an atomic SETNX lock on the
//! keyed store; everyone else polls the cache with jittered sleeps and never
//! touches the source of truth.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use medpulse_kv::{KeyedStore, KvError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("keyed store error: {0}")]
    Kv(#[from] KvError),

    /// Follower waited out the loader without seeing a value.
    #[error("cache is being rebuilt, try again later")]
    Busy,

    #[error("loader failed: {0}")]
    Loader(String),
}

/// How the value was obtained, mostly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served straight from the cache.
    Hit,
    /// This caller won the election and ran the loader.
    Loaded,
    /// A concurrent loader filled the cache while we polled.
    Followed,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL of a materialized list.
    pub cache_ttl: Duration,
    /// TTL of the loader election lock.
    pub lock_ttl: Duration,
    /// How long a follower polls before giving up with [`CacheError::Busy`].
    pub follow_timeout: Duration,
    /// Follower sleep jitter window.
    pub poll_min: Duration,
    pub poll_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(10),
            follow_timeout: Duration::from_secs(5),
            poll_min: Duration::from_millis(100),
            poll_max: Duration::from_millis(200),
        }
    }
}

pub struct ListCache {
    store: Arc<dyn KeyedStore>,
    config: CacheConfig,
}

impl ListCache {
    pub fn new(store: Arc<dyn KeyedStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Return the cached list at `key`, electing exactly one concurrent
    /// caller to materialize it from `loader` on a miss.
    ///
    /// An empty loader result is not cached: the call returns empty and
    /// concurrent followers time out with [`CacheError::Busy`].
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> Result<(Vec<String>, CacheOutcome), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
        E: std::fmt::Display,
    {
        // Fast path.
        let cached = self.store.lrange(key, 0, -1).await?;
        if !cached.is_empty() {
            return Ok((cached, CacheOutcome::Hit));
        }

        let lock_key = format!("{key}.lock");
        match self
            .store
            .acquire_lock(&lock_key, self.config.lock_ttl)
            .await?
        {
            Some(token) => {
                let result = self.load_as_winner(key, loader).await;
                // The lock is released on every exit path; a failed release
                // is only logged — the TTL bounds the damage.
                if let Err(e) = self.store.release_lock(&token).await {
                    warn!(key = %key, error = %e, "failed to release loader lock");
                }
                result
            }
            None => self.follow(key).await,
        }
    }

    async fn load_as_winner<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> Result<(Vec<String>, CacheOutcome), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
        E: std::fmt::Display,
    {
        // Double check: another writer may have committed between our miss
        // and winning the lock.
        let cached = self.store.lrange(key, 0, -1).await?;
        if !cached.is_empty() {
            return Ok((cached, CacheOutcome::Hit));
        }

        info!(key = %key, "cache miss, elected loader");
        let values = loader()
            .await
            .map_err(|e| CacheError::Loader(e.to_string()))?;

        if values.is_empty() {
            debug!(key = %key, "loader returned no rows, cache left empty");
            return Ok((values, CacheOutcome::Loaded));
        }

        self.store
            .replace_list(key, &values, self.config.cache_ttl)
            .await?;
        Ok((values, CacheOutcome::Loaded))
    }

    /// Loser path: wait for the elected loader, never touch the source.
    async fn follow(&self, key: &str) -> Result<(Vec<String>, CacheOutcome), CacheError> {
        let deadline = tokio::time::Instant::now() + self.config.follow_timeout;

        loop {
            // Jittered sleep so followers don't wake in lockstep.
            let sleep_ms = rand::thread_rng().gen_range(
                self.config.poll_min.as_millis() as u64..=self.config.poll_max.as_millis() as u64,
            );
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

            let cached = self.store.lrange(key, 0, -1).await?;
            if !cached.is_empty() {
                return Ok((cached, CacheOutcome::Followed));
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(key = %key, "follower timed out waiting for loader");
                return Err(CacheError::Busy);
            }
        }
    }
}
