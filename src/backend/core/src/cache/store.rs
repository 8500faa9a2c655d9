//! Cache store backends.
//!
//! The store is a plain key/value surface with per-key TTLs; it knows nothing
//! about what is cached. Two backends are provided:
//! - **MemoryStore**: in-process store for tests and single-node deployments
//! - **RedisStore**: shared store for production, so the bot and dashboard
//!   processes see the same cache and rate-limit windows

use crate::error::{ErrorCode, ErrorContext, MeshError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Key/value store with per-key expiration.
///
/// A key whose TTL has elapsed behaves as absent: `get` returns `None` and
/// `ttl` returns `None`. Rate-limit windows rely on exactly this property.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Set a value with a TTL in seconds.
    async fn setex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<()>;

    /// Get a value. Expired or missing keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Remaining TTL for a key, `None` if the key is absent or expired.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Batched get; the result vector is positionally aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Batched setex of `(key, ttl_secs, value)` entries.
    async fn setex_many(&self, entries: &[(String, u64, Vec<u8>)]) -> Result<()>;

    /// Delete all keys matching a glob pattern (`prefix*`), returning the count.
    async fn del_by_pattern(&self, pattern: &str) -> Result<u64>;

    /// Remove every key. Intended for tests and operator tooling.
    async fn clear(&self) -> Result<()>;

    /// Backend name for logging and metrics labels.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at.checked_duration_since(Instant::now())
    }
}

/// In-process cache store with lazy expiration on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn setex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        counter!("cache_sets_total", "backend" => "memory").increment(1);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            counter!("cache_deletes_total", "backend" => "memory").increment(deleted);
        }
        Ok(deleted)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        if let Some(entry) = self.entries.get(key) {
            if let Some(remaining) = entry.remaining() {
                return Ok(Some(remaining));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    async fn setex_many(&self, entries: &[(String, u64, Vec<u8>)]) -> Result<()> {
        for (key, ttl_secs, value) in entries {
            self.setex(key, *ttl_secs, value).await?;
        }
        Ok(())
    }

    async fn del_by_pattern(&self, pattern: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| Self::matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut deleted = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed cache store.
#[derive(Debug)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING. The whole
    /// handshake is bounded by `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .context(ErrorCode::CacheConnectionFailed, "Failed to create Redis client")?;

        let handshake = async {
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .context(ErrorCode::CacheConnectionFailed, "Failed to connect to Redis")?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context(ErrorCode::CacheConnectionFailed, "Redis ping failed")?;
            Ok::<_, MeshError>(())
        };

        tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                MeshError::with_internal(
                    ErrorCode::CacheConnectionFailed,
                    "Redis connection timed out",
                    format!("no connection after {}ms", connect_timeout.as_millis()),
                )
            })??;

        info!(url = %url, "Redis cache store connected");
        Ok(Self { client })
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context(ErrorCode::CacheConnectionFailed, "Failed to get Redis connection")
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn setex(&self, key: &str, ttl_secs: u64, value: &[u8]) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(MeshError::from)?;
        counter!("cache_sets_total", "backend" => "redis").increment(1);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_conn().await?;
        let data: Option<Vec<u8>> = conn.get(key).await.map_err(MeshError::from)?;
        Ok(data)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_conn().await?;
        let deleted: u64 = conn.del(keys).await.map_err(MeshError::from)?;
        if deleted > 0 {
            counter!("cache_deletes_total", "backend" => "redis").increment(deleted);
        }
        Ok(deleted)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.get_conn().await?;
        // TTL returns -2 for missing keys and -1 for keys without expiry.
        let secs: i64 = conn.ttl(key).await.map_err(MeshError::from)?;
        if secs > 0 {
            Ok(Some(Duration::from_secs(secs as u64)))
        } else {
            Ok(None)
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(MeshError::from)?;
        Ok(values)
    }

    async fn setex_many(&self, entries: &[(String, u64, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn().await?;
        let mut pipe = redis::pipe();
        for (key, ttl_secs, value) in entries {
            pipe.cmd("SETEX").arg(key).arg(ttl_secs).arg(value).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(MeshError::from)?;
        counter!("cache_sets_total", "backend" => "redis").increment(entries.len() as u64);
        Ok(())
    }

    async fn del_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(MeshError::from)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(MeshError::from)?;
                total_deleted += deleted;
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, deleted = total_deleted, "Pattern delete completed");
        Ok(total_deleted)
    }

    async fn clear(&self) -> Result<()> {
        // Scoped to keys this crate writes; never flushes the whole database.
        self.del_by_pattern("ticketmesh:*").await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
