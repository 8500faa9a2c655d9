//! Guild data facade.
//!
//! [`GuildDirectory`] is the surface the bot and dashboard call for guild
//! data. Every read follows the same path: cache lookup, then on a miss a
//! deduplicated task through the executor, which calls the remote API behind
//! the rate-limit gate and writes the result back with the resource's TTL.
//! Concurrent misses for the same resource share one remote call because
//! cache keys double as task ids.

pub mod types;

pub use types::{
    ChannelKind, GuildChannel, GuildMember, GuildRole, GuildSnapshot, PresenceStatus, UserPresence,
};

use crate::cache::{Cache, CacheKey, CacheMetrics, ResourceKind};
use crate::error::MeshError;
use crate::queue::{QueueStats, SubmitOptions, TaskError, TaskQueue};
use crate::ratelimit::RateLimitGate;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Remote guild API. Implemented over the Discord client in the bot process
/// and stubbed in tests.
#[async_trait]
pub trait GuildGateway: Send + Sync {
    async fn fetch_snapshot(&self, guild_id: &str) -> Result<GuildSnapshot, TaskError>;
    async fn fetch_members(&self, guild_id: &str) -> Result<Vec<GuildMember>, TaskError>;
    async fn fetch_channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>, TaskError>;
    async fn fetch_roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, TaskError>;

    /// Presence for a specific set of users. Callers only ask for users they
    /// could not serve from cache.
    async fn fetch_presences(
        &self,
        guild_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<UserPresence>, TaskError>;
}

/// Cached, deduplicated, rate-limit-aware access to guild data.
///
/// Read methods return `None` when the resource could not be produced; the
/// failure is logged and counted, and callers render a degraded view rather
/// than an error page.
#[derive(Clone)]
pub struct GuildDirectory {
    cache: Cache,
    metrics: Arc<CacheMetrics>,
    queue: Arc<TaskQueue<Value>>,
    gate: RateLimitGate,
    gateway: Arc<dyn GuildGateway>,
}

impl GuildDirectory {
    pub fn new(
        cache: Cache,
        metrics: Arc<CacheMetrics>,
        queue: Arc<TaskQueue<Value>>,
        gate: RateLimitGate,
        gateway: Arc<dyn GuildGateway>,
    ) -> Self {
        Self {
            cache,
            metrics,
            queue,
            gate,
            gateway,
        }
    }

    pub fn cache_metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn snapshot(&self, guild_id: &str, force_refresh: bool) -> Option<GuildSnapshot> {
        let gateway = self.gateway.clone();
        let gid = guild_id.to_string();
        self.fetch_through(
            CacheKey::guild(ResourceKind::Snapshot, guild_id),
            "guild",
            force_refresh,
            move || {
                let gateway = gateway.clone();
                let gid = gid.clone();
                async move { gateway.fetch_snapshot(&gid).await }
            },
        )
        .await
    }

    pub async fn members(&self, guild_id: &str, force_refresh: bool) -> Option<Vec<GuildMember>> {
        let gateway = self.gateway.clone();
        let gid = guild_id.to_string();
        self.fetch_through(
            CacheKey::guild(ResourceKind::Members, guild_id),
            "members",
            force_refresh,
            move || {
                let gateway = gateway.clone();
                let gid = gid.clone();
                async move { gateway.fetch_members(&gid).await }
            },
        )
        .await
    }

    pub async fn channels(&self, guild_id: &str, force_refresh: bool) -> Option<Vec<GuildChannel>> {
        let gateway = self.gateway.clone();
        let gid = guild_id.to_string();
        self.fetch_through(
            CacheKey::guild(ResourceKind::Channels, guild_id),
            "channels",
            force_refresh,
            move || {
                let gateway = gateway.clone();
                let gid = gid.clone();
                async move { gateway.fetch_channels(&gid).await }
            },
        )
        .await
    }

    pub async fn roles(&self, guild_id: &str, force_refresh: bool) -> Option<Vec<GuildRole>> {
        let gateway = self.gateway.clone();
        let gid = guild_id.to_string();
        self.fetch_through(
            CacheKey::guild(ResourceKind::Roles, guild_id),
            "roles",
            force_refresh,
            move || {
                let gateway = gateway.clone();
                let gid = gid.clone();
                async move { gateway.fetch_roles(&gid).await }
            },
        )
        .await
    }

    /// Presence for a set of users, keyed by user id.
    ///
    /// Cached users are served directly; the remaining users go to the
    /// remote API in one batched call. Users the API could not resolve are
    /// absent from the result.
    pub async fn check_presence(
        &self,
        guild_id: &str,
        user_ids: &[String],
        force_refresh: bool,
    ) -> HashMap<String, UserPresence> {
        let mut result = HashMap::new();
        if user_ids.is_empty() {
            return result;
        }

        let keys: Vec<String> = user_ids
            .iter()
            .map(|u| CacheKey::presence(guild_id, u).render())
            .collect();

        let start = Instant::now();
        let cached: Vec<Option<UserPresence>> = if force_refresh {
            user_ids.iter().map(|_| None).collect()
        } else {
            self.cache.get_many(&keys).await
        };
        let lookup_time = start.elapsed();

        let mut missing: Vec<String> = Vec::new();
        for ((user_id, key), value) in user_ids.iter().zip(&keys).zip(cached) {
            match value {
                Some(presence) => {
                    self.metrics.record_hit(key, lookup_time);
                    result.insert(user_id.clone(), presence);
                }
                None => {
                    self.metrics.record_miss(key, lookup_time);
                    missing.push(user_id.clone());
                }
            }
        }
        if missing.is_empty() {
            return result;
        }

        missing.sort();
        let task_id = format!("guild:presence:{}:{}", guild_id, missing.join("+"));

        let gateway = self.gateway.clone();
        let gate = self.gate.clone();
        let cache = self.cache.clone();
        let gid = guild_id.to_string();
        let op = move || {
            let gateway = gateway.clone();
            let gate = gate.clone();
            let cache = cache.clone();
            let gid = gid.clone();
            let missing = missing.clone();
            async move {
                let presences = gate
                    .execute("presence", || {
                        let gateway = gateway.clone();
                        let gid = gid.clone();
                        let missing = missing.clone();
                        async move { gateway.fetch_presences(&gid, &missing).await }
                    })
                    .await?;

                let entries: Vec<(String, u64, UserPresence)> = presences
                    .iter()
                    .map(|p| {
                        (
                            CacheKey::presence(&gid, &p.user_id).render(),
                            ResourceKind::Presence.ttl_secs(),
                            p.clone(),
                        )
                    })
                    .collect();
                cache.set_many(&entries).await;

                serde_json::to_value(&presences)
                    .map_err(|e| TaskError::Fatal(format!("presence serialize failed: {e}")))
            }
        };

        match self.queue.submit(task_id, op, SubmitOptions::default()).await {
            Ok(json) => match serde_json::from_value::<Vec<UserPresence>>(json) {
                Ok(presences) => {
                    for presence in presences {
                        result.insert(presence.user_id.clone(), presence);
                    }
                }
                Err(e) => MeshError::from(e).with_context("guild_id", guild_id).log(),
            },
            Err(e) => {
                warn!(guild_id = %guild_id, error = %e, "Presence fetch failed, serving cached subset")
            }
        }
        result
    }

    /// Drop every cached resource of a guild so the next reads refetch.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, guild_id: &str) -> u64 {
        let keys: Vec<String> = [
            ResourceKind::Snapshot,
            ResourceKind::Members,
            ResourceKind::Channels,
            ResourceKind::Roles,
        ]
        .iter()
        .map(|kind| CacheKey::guild(*kind, guild_id).render())
        .collect();

        let mut removed = self.cache.delete(&keys).await;
        removed += self
            .cache
            .delete_by_pattern(&CacheKey::presence_pattern(guild_id))
            .await;

        info!(guild_id = %guild_id, removed, "Invalidated cached guild data");
        removed
    }

    /// Cache-then-queue read path shared by every guild-wide resource.
    async fn fetch_through<T, F, Fut>(
        &self,
        key: CacheKey,
        endpoint: &'static str,
        force_refresh: bool,
        fetch: F,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let key_str = key.render();
        let start = Instant::now();
        if !force_refresh {
            if let Some(value) = self.cache.get::<T>(&key_str).await {
                self.metrics.record_hit(&key_str, start.elapsed());
                return Some(value);
            }
        }
        self.metrics.record_miss(&key_str, start.elapsed());

        let gate = self.gate.clone();
        let cache = self.cache.clone();
        let ttl = key.kind().ttl_secs();
        let op_key = key_str.clone();
        let op = move || {
            let gate = gate.clone();
            let cache = cache.clone();
            let fetch = fetch.clone();
            let op_key = op_key.clone();
            async move {
                let value = gate.execute(endpoint, || fetch()).await?;
                let json = serde_json::to_value(&value)
                    .map_err(|e| TaskError::Fatal(format!("cache serialize failed: {e}")))?;
                cache.set(&op_key, ttl, &json).await;
                Ok(json)
            }
        };

        match self.queue.submit(key_str.clone(), op, SubmitOptions::default()).await {
            Ok(json) => match serde_json::from_value(json) {
                Ok(value) => Some(value),
                Err(e) => {
                    MeshError::from(e).with_context("key", &key_str).log();
                    None
                }
            },
            Err(e) => {
                warn!(key = %key_str, error = %e, "Resource fetch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::queue::QueueConfig;
    use crate::ratelimit::RateLimitConfig;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeGateway {
        member_calls: AtomicUsize,
        snapshot_calls: AtomicUsize,
        presence_requests: Mutex<Vec<Vec<String>>>,
        fail_members: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl GuildGateway for FakeGateway {
        async fn fetch_snapshot(&self, guild_id: &str) -> Result<GuildSnapshot, TaskError> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(GuildSnapshot {
                id: guild_id.to_string(),
                name: "Support Hub".to_string(),
                icon_url: None,
                member_count: 2,
                owner_id: "owner".to_string(),
            })
        }

        async fn fetch_members(&self, _guild_id: &str) -> Result<Vec<GuildMember>, TaskError> {
            self.member_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_members.load(Ordering::SeqCst) {
                return Err(TaskError::Fatal("missing permissions".to_string()));
            }
            Ok(vec![GuildMember {
                user_id: "u1".to_string(),
                username: "alice".to_string(),
                nickname: None,
                role_ids: vec!["r1".to_string()],
                joined_at: Utc::now(),
            }])
        }

        async fn fetch_channels(&self, _guild_id: &str) -> Result<Vec<GuildChannel>, TaskError> {
            Ok(vec![GuildChannel {
                id: "c1".to_string(),
                name: "tickets".to_string(),
                kind: ChannelKind::Text,
                position: 0,
                parent_id: None,
            }])
        }

        async fn fetch_roles(&self, _guild_id: &str) -> Result<Vec<GuildRole>, TaskError> {
            Ok(vec![GuildRole {
                id: "r1".to_string(),
                name: "staff".to_string(),
                color: 0,
                position: 1,
                permissions: 8,
            }])
        }

        async fn fetch_presences(
            &self,
            _guild_id: &str,
            user_ids: &[String],
        ) -> Result<Vec<UserPresence>, TaskError> {
            self.presence_requests.lock().push(user_ids.to_vec());
            Ok(user_ids
                .iter()
                .map(|u| UserPresence {
                    user_id: u.clone(),
                    status: PresenceStatus::Online,
                    activity: None,
                })
                .collect())
        }
    }

    fn directory(gateway: Arc<FakeGateway>) -> GuildDirectory {
        let store: Arc<dyn crate::cache::CacheStore> = Arc::new(MemoryStore::new());
        GuildDirectory::new(
            Cache::new(store.clone(), "test:"),
            Arc::new(CacheMetrics::new()),
            TaskQueue::new(QueueConfig {
                base_delay: Duration::from_millis(10),
                ..Default::default()
            }),
            RateLimitGate::new(store, RateLimitConfig::default()),
            gateway,
        )
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        let first = dir.members("g1", false).await.unwrap();
        let second = dir.members("g1", false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 1);

        let key = CacheKey::guild(ResourceKind::Members, "g1").render();
        assert!((dir.cache_metrics().hit_rate(&key) - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        dir.members("g1", false).await.unwrap();
        dir.members("g1", true).await.unwrap();
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 2);

        // the forced fetch refreshed the cache entry
        dir.members("g1", false).await.unwrap();
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_cold_reads_share_one_fetch() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        let (a, b) = tokio::join!(dir.snapshot("g1", false), dir.snapshot("g1", false));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(gateway.snapshot_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        dir.members("g1", false).await.unwrap();
        let removed = dir.invalidate("g1").await;
        assert_eq!(removed, 1);

        dir.members("g1", false).await.unwrap();
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_scopes_to_one_guild() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        dir.members("g1", false).await.unwrap();
        dir.members("g2", false).await.unwrap();
        dir.invalidate("g1").await;

        dir.members("g2", false).await.unwrap();
        // g2 still cached, only g1 was dropped
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_presence_batch_only_fetches_misses() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        let warm = dir.check_presence("g1", &["a".to_string()], false).await;
        assert_eq!(warm.len(), 1);

        let mixed = dir
            .check_presence("g1", &["a".to_string(), "b".to_string()], false)
            .await;
        assert_eq!(mixed.len(), 2);
        assert_eq!(mixed["a"].status, PresenceStatus::Online);

        let requests = gateway.presence_requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], vec!["a".to_string()]);
        assert_eq!(requests[1], vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_presence_all_cached_skips_remote() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway.clone());

        dir.check_presence("g1", &["a".to_string(), "b".to_string()], false)
            .await;
        dir.check_presence("g1", &["a".to_string(), "b".to_string()], false)
            .await;

        assert_eq!(gateway.presence_requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_fetch_degrades_to_none() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.fail_members.store(true, Ordering::SeqCst);
        let dir = directory(gateway.clone());

        assert_eq!(dir.members("g1", false).await, None);
        // fatal errors are not retried
        assert_eq!(gateway.member_calls.load(Ordering::SeqCst), 1);

        // a later read tries again instead of caching the failure
        gateway.fail_members.store(false, Ordering::SeqCst);
        assert!(dir.members("g1", false).await.is_some());
    }

    #[tokio::test]
    async fn test_channels_and_roles_roundtrip() {
        let gateway = Arc::new(FakeGateway::default());
        let dir = directory(gateway);

        let channels = dir.channels("g1", false).await.unwrap();
        assert_eq!(channels[0].kind, ChannelKind::Text);

        let roles = dir.roles("g1", false).await.unwrap();
        assert_eq!(roles[0].name, "staff");
    }
}
