//! Runtime wiring.
//!
//! [`CoreRuntime`] builds the cache, executor, gate, and facade from one
//! [`CoreConfig`] and hands out the shared handles. Both host processes (the
//! bot and the dashboard) construct one runtime at startup and pass the
//! directory to whatever needs guild data; nothing in this crate reaches for
//! process-wide singletons.

use crate::cache::{Cache, CacheMetrics, CacheStore, RedisStore};
use crate::config::CoreConfig;
use crate::error::Result;
use crate::facade::{GuildDirectory, GuildGateway};
use crate::queue::{TaskEvent, TaskQueue};
use crate::ratelimit::RateLimitGate;
use crate::telemetry::{init_logging, init_metrics, MetricsConfig, MetricsHandle};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Wired core: one executor, one cache, one gate, one facade.
pub struct CoreRuntime {
    config: CoreConfig,
    queue: Arc<TaskQueue<Value>>,
    directory: GuildDirectory,
}

impl CoreRuntime {
    /// Wire the core around an already-constructed store.
    pub fn with_store(
        config: CoreConfig,
        store: Arc<dyn CacheStore>,
        gateway: Arc<dyn GuildGateway>,
    ) -> Self {
        let cache = Cache::new(store.clone(), config.cache.namespace_prefix.clone());
        let metrics = Arc::new(CacheMetrics::new());
        let queue = TaskQueue::new(config.queue.clone());
        let gate = RateLimitGate::new(store, config.rate_limit.clone());
        let directory = GuildDirectory::new(cache, metrics, queue.clone(), gate, gateway);

        info!(
            concurrency = config.queue.concurrency,
            "Core runtime wired"
        );
        Self {
            config,
            queue,
            directory,
        }
    }

    /// Wire the core against the Redis instance named in the config.
    pub async fn connect(config: CoreConfig, gateway: Arc<dyn GuildGateway>) -> Result<Self> {
        let store = Arc::new(
            RedisStore::connect(
                &config.redis.url,
                Duration::from_secs(config.redis.connect_timeout_secs),
            )
            .await?,
        );
        Ok(Self::with_store(config, store, gateway))
    }

    /// Initialize logging and metrics from the config. Call once per
    /// process, before `connect`.
    pub fn init_telemetry(config: &CoreConfig) -> anyhow::Result<MetricsHandle> {
        init_logging(&config.logging)?;
        init_metrics(&MetricsConfig::default())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn directory(&self) -> &GuildDirectory {
        &self.directory
    }

    pub fn queue(&self) -> &Arc<TaskQueue<Value>> {
        &self.queue
    }

    /// Subscribe to task lifecycle events, for the dashboard's activity feed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.queue.subscribe()
    }

    /// Drop all pending work, e.g. on shutdown. Running tasks finish.
    pub fn clear_pending(&self) -> usize {
        self.queue.clear()
    }
}
