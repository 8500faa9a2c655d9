//! Configuration management.

use serde::Deserialize;

use crate::queue::QueueConfig;
use crate::ratelimit::RateLimitConfig;
use crate::telemetry::logging::LoggingConfig;

/// Main configuration for the API access core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Task queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Rate limit gate configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Namespace prefix applied to every cache key
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_namespace_prefix() -> String {
    "ticketmesh:cache:".to_string()
}

impl CoreConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TICKETMESH").separator("__"))
            .build()?;

        let cfg: CoreConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TICKETMESH").separator("__"))
            .build()?;

        let cfg: CoreConfig = config.try_deserialize()?;
        Ok(cfg)
    }
}
