//! Rate-limit gate for remote API calls.
//!
//! When the remote API answers 429 for an endpoint, the gate records a block
//! window in the cache store keyed by endpoint. Later calls to the same
//! endpoint wait out the remaining window before invoking the API at all,
//! so one 429 response throttles every worker sharing the store, across
//! processes when the store is Redis.
//!
//! Store failures fail open: a broken store must never stop API traffic.

use crate::cache::CacheStore;
use crate::queue::TaskError;
use metrics::counter;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Rate-limit gate configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// How many rate-limit waits (block windows or 429 responses) a single
    /// call may absorb before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Store key prefix for block windows
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_key_prefix() -> String {
    "ticketmesh:ratelimit:".to_string()
}

/// Shared gate in front of every remote API call.
#[derive(Clone)]
pub struct RateLimitGate {
    store: Arc<dyn CacheStore>,
    config: RateLimitConfig,
}

impl RateLimitGate {
    pub fn new(store: Arc<dyn CacheStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn window_key(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.key_prefix, endpoint)
    }

    /// Remaining block window for an endpoint, if one is active.
    pub async fn is_limited(&self, endpoint: &str) -> Option<Duration> {
        match self.store.ttl(&self.window_key(endpoint)).await {
            Ok(remaining) => remaining,
            Err(e) => {
                // fail open, a broken store must not block API traffic
                e.with_context("endpoint", endpoint).log();
                None
            }
        }
    }

    /// Record a block window for an endpoint. The TTL is the retry-after
    /// rounded up to whole seconds, at least one.
    pub async fn note_limited(&self, endpoint: &str, retry_after_ms: u64) {
        let ttl_secs = retry_after_ms.div_ceil(1000).max(1);
        counter!("rate_limit_windows_total", "endpoint" => endpoint.to_string()).increment(1);
        if let Err(e) = self
            .store
            .setex(&self.window_key(endpoint), ttl_secs, b"1")
            .await
        {
            e.with_context("endpoint", endpoint).log();
        }
    }

    /// Run an operation against an endpoint, honoring block windows.
    ///
    /// If a window is active the call sleeps out the remainder first. A 429
    /// from the operation records a fresh window, sleeps the advertised
    /// retry-after, and invokes the operation again without re-checking the
    /// window it just served. Each wait consumes one retry; when the budget
    /// runs out the call fails with [`TaskError::RateLimitExhausted`]. Any
    /// other error passes through untouched.
    pub async fn execute<T, F, Fut>(&self, endpoint: &str, operation: F) -> Result<T, TaskError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut retries = 0u32;
        let mut skip_window_check = false;

        loop {
            if !skip_window_check {
                if let Some(remaining) = self.is_limited(endpoint).await {
                    if retries >= self.config.max_retries {
                        return Err(TaskError::RateLimitExhausted {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    retries += 1;
                    counter!("rate_limit_blocks_total", "endpoint" => endpoint.to_string())
                        .increment(1);
                    debug!(
                        endpoint = %endpoint,
                        wait_ms = remaining.as_millis() as u64,
                        "Waiting out active rate limit window"
                    );
                    tokio::time::sleep(remaining).await;
                    // another worker may have recorded a fresh window while
                    // this one slept
                    continue;
                }
            }
            skip_window_check = false;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(TaskError::RateLimited { retry_after_ms, .. }) => {
                    self.note_limited(endpoint, retry_after_ms).await;
                    if retries >= self.config.max_retries {
                        return Err(TaskError::RateLimitExhausted {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    retries += 1;
                    debug!(
                        endpoint = %endpoint,
                        retry_after_ms,
                        "Rate limited by remote API, sleeping before retry"
                    );
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    skip_window_check = true;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
