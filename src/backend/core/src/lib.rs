//! # TicketMesh Core
//!
//! Shared API-access core for the TicketMesh support-ticket platform. The
//! bot and the dashboard both read guild data through this crate instead of
//! calling the remote API directly.
//!
//! ## Architecture
//!
//! - **Task Queue**: Bounded executor with per-id deduplication, priorities,
//!   and exponential-backoff retries
//! - **Rate Limit Gate**: Shared per-endpoint 429 block windows, persisted in
//!   the cache store so every process honors them
//! - **Cache**: TTL'd guild resource cache (memory or Redis) with per-key
//!   hit/miss accounting
//! - **Facade**: `GuildDirectory`, the cache-then-fetch read surface the
//!   host processes call
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod queue;
pub mod ratelimit;
pub mod runtime;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, MeshError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{Cache, CacheKey, CacheMetrics, CacheStore, MemoryStore, RedisStore, ResourceKind};
    pub use crate::config::CoreConfig;
    pub use crate::error::{ErrorCode, ErrorContext, MeshError, Result};
    pub use crate::facade::{
        ChannelKind, GuildChannel, GuildDirectory, GuildGateway, GuildMember, GuildRole,
        GuildSnapshot, PresenceStatus, UserPresence,
    };
    pub use crate::queue::{
        QueueConfig, QueueStats, SubmitOptions, TaskError, TaskEvent, TaskPriority, TaskQueue,
    };
    pub use crate::ratelimit::{RateLimitConfig, RateLimitGate};
    pub use crate::runtime::CoreRuntime;
    pub use crate::telemetry::{init_logging, init_metrics, LoggingConfig, MetricsConfig};
}
