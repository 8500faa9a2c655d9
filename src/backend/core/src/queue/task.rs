//! Task types: errors, priorities, submit options, events, and queue config.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors a task operation can produce, and the outcomes the queue itself
/// reports to waiters.
///
/// The error carries its own retry classification instead of the queue
/// inspecting error shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The remote API returned a rate-limit response for an endpoint.
    #[error("rate limited on {endpoint}, retry after {retry_after_ms}ms")]
    RateLimited {
        endpoint: String,
        retry_after_ms: u64,
    },

    /// The rate-limit gate gave up after its retry budget.
    #[error("rate limit retries exhausted for {endpoint}")]
    RateLimitExhausted { endpoint: String },

    /// A transient failure (network error, 5xx) worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A permanent failure (bad request, missing permissions); retrying
    /// cannot help.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// The task was removed from the queue before it could run.
    #[error("task cancelled: {0}")]
    Cancelled(String),
}

impl TaskError {
    /// Whether the executor should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Transient(_)
                | TaskError::RateLimited { .. }
                | TaskError::RateLimitExhausted { .. }
        )
    }
}

/// Execution priority. Higher priorities are dequeued first; within a
/// priority, submission order is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: TaskPriority,
    /// Override the queue's configured attempt budget for this task.
    pub max_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn with_priority(priority: TaskPriority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

/// Lifecycle events broadcast by the queue for dashboards and logs.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// An attempt started (attempt is 1-based).
    Started { task_id: String, attempt: u32 },
    /// An attempt failed and another will follow after the delay.
    Retrying {
        task_id: String,
        attempt: u32,
        delay: Duration,
        error: TaskError,
    },
    /// The task completed successfully.
    Completed { task_id: String, attempts: u32 },
    /// The task failed permanently.
    Failed {
        task_id: String,
        attempts: u32,
        error: TaskError,
    },
}

/// Task queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of tasks running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempt budget per task (first run plus retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single retry delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl QueueConfig {
    /// Delay before retrying after the given failed attempt (1-based).
    /// Grows exponentially from `base_delay` and is capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let millis = self.base_delay.as_millis() as f64
            * self.backoff_multiplier.powi(exponent as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TaskError::Transient("timeout".into()).is_retryable());
        assert!(TaskError::RateLimited {
            endpoint: "guilds".into(),
            retry_after_ms: 100
        }
        .is_retryable());
        assert!(!TaskError::Fatal("missing permissions".into()).is_retryable());
        assert!(!TaskError::Cancelled("cleared".into()).is_retryable());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = QueueConfig {
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        // 400ms uncapped, clamped to max_delay
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }
}
