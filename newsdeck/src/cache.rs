use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which tier a cache instance is currently serving from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Distributed,
    InProcess,
}

/// Storage behind the cache. Values are stored as strings; JSON encoding of
/// structured values happens above this seam.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// Increment a windowed counter for rate limiting. Returns `None` when
    /// this backend cannot count reliably; rate limiting then fails open.
    async fn counter(&self, key: &str, window: Duration) -> Result<Option<u64>>;
    async fn len(&self) -> usize;
    fn tier(&self) -> CacheTier;
}

/// Redis-backed distributed tier.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET failed")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .context("redis SETEX failed")?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.context("redis DEL failed")?;
        Ok(())
    }

    async fn counter(&self, key: &str, window: Duration) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await.context("redis INCR failed")?;
        if count == 1 {
            conn.expire::<_, ()>(key, window.as_secs().max(1) as i64)
                .await
                .context("redis EXPIRE failed")?;
        }
        Ok(Some(count))
    }

    async fn len(&self) -> usize {
        let mut conn = self.conn.clone();
        redis::cmd("DBSIZE")
            .query_async::<_, usize>(&mut conn)
            .await
            .unwrap_or(0)
    }

    fn tier(&self) -> CacheTier {
        CacheTier::Distributed
    }
}

struct MemoryEntry {
    value: String,
    inserted_at: Instant,
    ttl: Duration,
}

/// In-process fallback tier. Expiry is computed lazily at read time by
/// comparing the insertion instant against the TTL; there is no eviction
/// task, so expired entries leave the map only when accessed.
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= entry.ttl => {
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        // Whole-value replacement under the lock; resets expiry.
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn counter(&self, _key: &str, _window: Duration) -> Result<Option<u64>> {
        // In-process counts would reset on restart and undercount across
        // processes; rate limiting fails open instead.
        Ok(None)
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn tier(&self) -> CacheTier {
        CacheTier::InProcess
    }
}

/// Counters reported by [`FailoverCache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub size: usize,
}

/// Result of a typed read. A stored value that no longer deserializes is
/// handed back raw instead of surfacing an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue<T> {
    Typed(T),
    Raw(String),
}

/// Two-tier cache with one-directional failover.
///
/// Construction attempts the distributed (Redis) connection; on failure the
/// instance starts on the in-process tier. Any operational error during a
/// call swaps the active backend to the in-process tier for the rest of the
/// process lifetime and retries the failed operation there once. There is no
/// automatic reconnection.
pub struct FailoverCache {
    backend: RwLock<Arc<dyn CacheBackend>>,
    fallback: Arc<MemoryBackend>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl FailoverCache {
    pub async fn connect(redis_url: Option<&str>, default_ttl: Duration) -> Self {
        let fallback = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn CacheBackend> = match redis_url {
            Some(url) => match RedisBackend::connect(url).await {
                Ok(b) => {
                    info!(url = %url, "connected to distributed cache");
                    Arc::new(b)
                }
                Err(e) => {
                    warn!(error = %e, "distributed cache unreachable; falling back to in-process cache");
                    fallback.clone()
                }
            },
            None => {
                info!("no redis url configured; using in-process cache");
                fallback.clone()
            }
        };

        Self {
            backend: RwLock::new(backend),
            fallback,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// An in-process-only instance, used when no distributed tier is wanted.
    pub fn in_process(default_ttl: Duration) -> Self {
        let fallback = Arc::new(MemoryBackend::new());
        Self {
            backend: RwLock::new(fallback.clone() as Arc<dyn CacheBackend>),
            fallback,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Start on an arbitrary backend, with a fresh in-process fallback.
    #[cfg(test)]
    fn with_backend(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend: RwLock::new(backend),
            fallback: Arc::new(MemoryBackend::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    async fn active(&self) -> Arc<dyn CacheBackend> {
        self.backend.read().await.clone()
    }

    /// Swap the active backend to the in-process tier. One-directional for
    /// the process lifetime.
    async fn downgrade(&self, reason: &anyhow::Error) {
        let mut guard = self.backend.write().await;
        if guard.tier() == CacheTier::Distributed {
            warn!(error = %reason, "distributed cache failure; downgrading to in-process tier");
            *guard = self.fallback.clone();
        }
    }

    pub async fn tier(&self) -> CacheTier {
        self.backend.read().await.tier()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let backend = self.active().await;
        let value = match backend.get(key).await {
            Ok(v) => v,
            Err(e) => {
                self.downgrade(&e).await;
                self.fallback.get(key).await.unwrap_or_default()
            }
        };
        match value {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value; returns whether the write landed in any tier.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.sets.fetch_add(1, Ordering::Relaxed);
        let backend = self.active().await;
        match backend.set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.downgrade(&e).await;
                self.fallback.set(key, value, ttl).await.is_ok()
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let backend = self.active().await;
        if let Err(e) = backend.remove(key).await {
            self.downgrade(&e).await;
            let _ = self.fallback.remove(key).await;
        }
    }

    /// Typed read. Deserialization failure yields the raw stored string.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<CachedValue<T>> {
        let raw = self.get(key).await?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(CachedValue::Typed(value)),
            Err(e) => {
                debug!(key = %key, error = %e, "cached value failed to deserialize; returning raw");
                Some(CachedValue::Raw(raw))
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_string(value) {
            Ok(encoded) => self.set(key, &encoded, ttl).await,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialize value for cache");
                false
            }
        }
    }

    /// Cache-aside read: return the cached value under `key`, or run `op`,
    /// store its result under `key`, and return it. A raw (undeserializable)
    /// cached value counts as a miss and is overwritten.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, op: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if let Some(CachedValue::Typed(value)) = self.get_json::<T>(key).await {
            return value;
        }
        let value = op().await;
        self.set_json(key, &value, ttl).await;
        value
    }

    pub async fn stats(&self) -> CacheStats {
        let backend = self.active().await;
        CacheStats {
            tier: backend.tier(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: backend.len().await,
        }
    }
}

/// Deterministic cache key: a pure function of the operation name and its
/// arguments, in order.
pub fn cache_key(op: &str, args: &[&str]) -> String {
    let mut key = op.to_string();
    for arg in args {
        key.push(':');
        key.push_str(arg);
    }
    key
}

/// Fixed-window rate limiting on top of the distributed tier.
///
/// When the distributed tier is unavailable the limiter is open (always
/// allows) so a cache outage cannot become a total outage.
pub struct RateLimiter {
    cache: Arc<FailoverCache>,
}

impl RateLimiter {
    pub fn new(cache: Arc<FailoverCache>) -> Self {
        Self { cache }
    }

    /// Returns whether the operation is allowed for this identifier and
    /// operation class within the current window.
    pub async fn check(
        &self,
        identifier: &str,
        op_class: &str,
        limit: u64,
        window: Duration,
    ) -> bool {
        let bucket = Utc::now().timestamp() / window.as_secs().max(1) as i64;
        let key = cache_key("rate", &[identifier, op_class, &bucket.to_string()]);
        let backend = self.cache.active().await;
        match backend.counter(&key, window).await {
            Ok(Some(count)) => count <= limit,
            Ok(None) => true,
            Err(e) => {
                self.cache.downgrade(&e).await;
                true
            }
        }
    }
}
