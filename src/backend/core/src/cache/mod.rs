//! Guild resource caching.
//!
//! Layers, bottom to top:
//! - [`store`]: raw byte-oriented key/value backends (memory, Redis)
//! - [`key`]: the key schema and per-resource TTLs
//! - [`metrics`]: per-key hit/miss accounting
//! - [`Cache`]: typed JSON front over a store, with a namespace prefix
//!
//! The typed front fails open: a broken store is logged and treated as a
//! cache miss so the read path degrades to uncached fetches instead of
//! erroring.

pub mod key;
pub mod metrics;
pub mod store;

pub use key::{CacheKey, ResourceKind};
pub use metrics::{CacheMetrics, KeyMetrics, OverallStats};
pub use store::{CacheStore, MemoryStore, RedisStore};

use crate::error::MeshError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Typed JSON cache over a [`CacheStore`].
///
/// Values are serialized with `serde_json`. Every key is prefixed with the
/// configured namespace so multiple deployments can share a Redis instance.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    namespace: String,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Fetch and deserialize a value. Store failures and undecodable
    /// payloads are logged and reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.namespaced(key);
        let bytes = match self.store.get(&full_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                e.with_context("key", key).log();
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                MeshError::from(e).with_context("key", key).log();
                None
            }
        }
    }

    /// Serialize and store a value with a TTL. Failures are logged; the
    /// caller keeps its freshly fetched value either way.
    pub async fn set<T: Serialize>(&self, key: &str, ttl_secs: u64, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                MeshError::from(e).with_context("key", key).log();
                return;
            }
        };
        if let Err(e) = self.store.setex(&self.namespaced(key), ttl_secs, &bytes).await {
            e.with_context("key", key).log();
        }
    }

    /// Delete keys, returning how many existed. Failures are logged and
    /// reported as zero deletions.
    pub async fn delete(&self, keys: &[String]) -> u64 {
        let full_keys: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        match self.store.del(&full_keys).await {
            Ok(n) => n,
            Err(e) => {
                e.with_context("keys", keys).log();
                0
            }
        }
    }

    /// Delete every key matching a glob pattern within the namespace.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self.store.del_by_pattern(&self.namespaced(pattern)).await {
            Ok(n) => n,
            Err(e) => {
                e.with_context("pattern", pattern).log();
                0
            }
        }
    }

    /// Batched typed get, positionally aligned with `keys`. A store failure
    /// reports every key as a miss.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let full_keys: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let raw = match self.store.get_many(&full_keys).await {
            Ok(raw) => raw,
            Err(e) => {
                e.with_context("keys", keys).log();
                return keys.iter().map(|_| None).collect();
            }
        };

        raw.into_iter()
            .map(|maybe| maybe.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
            .collect()
    }

    /// Batched typed write of `(key, ttl_secs, value)` entries.
    pub async fn set_many<T: Serialize>(&self, entries: &[(String, u64, T)]) {
        let mut raw = Vec::with_capacity(entries.len());
        for (key, ttl_secs, value) in entries {
            match serde_json::to_vec(value) {
                Ok(bytes) => raw.push((self.namespaced(key), *ttl_secs, bytes)),
                Err(e) => MeshError::from(e).with_context("key", key).log(),
            }
        }
        if let Err(e) = self.store.setex_many(&raw).await {
            e.log();
        }
    }
}
