//! Per-key cache hit/miss accounting.
//!
//! The `metrics` crate counters feed Prometheus; this module additionally
//! keeps an in-process per-key ledger so operators can ask "which lookups
//! are missing most" without a metrics backend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct KeyCounters {
    hits: u64,
    misses: u64,
    total_lookup_micros: u64,
    last_accessed: Option<DateTime<Utc>>,
}

impl KeyCounters {
    fn total(&self) -> u64 {
        self.hits + self.misses
    }

    fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    fn avg_lookup_micros(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.total_lookup_micros as f64 / total as f64
        }
    }
}

/// Snapshot of one key's counters.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMetrics {
    pub key: String,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate as a percentage in `[0, 100]`.
    pub hit_rate: f64,
    pub avg_lookup_micros: f64,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Aggregate counters across every tracked key.
#[derive(Debug, Clone, Serialize)]
pub struct OverallStats {
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_requests: u64,
    pub overall_hit_rate: f64,
    pub tracked_keys: usize,
}

/// Thread-safe hit/miss recorder, shared across the facade's fetch paths.
#[derive(Default)]
pub struct CacheMetrics {
    per_key: DashMap<String, KeyCounters>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            per_key: DashMap::new(),
        }
    }

    /// Record a cache hit and the time the lookup took.
    pub fn record_hit(&self, key: &str, lookup_time: Duration) {
        let micros = lookup_time.as_micros() as u64;
        let mut entry = self.per_key.entry(key.to_string()).or_default();
        entry.hits += 1;
        entry.total_lookup_micros += micros;
        entry.last_accessed = Some(Utc::now());
        drop(entry);

        counter!("cache_hits_total").increment(1);
        histogram!("cache_lookup_duration_seconds").record(lookup_time.as_secs_f64());
    }

    /// Record a cache miss and the time the lookup took.
    pub fn record_miss(&self, key: &str, lookup_time: Duration) {
        let micros = lookup_time.as_micros() as u64;
        let mut entry = self.per_key.entry(key.to_string()).or_default();
        entry.misses += 1;
        entry.total_lookup_micros += micros;
        entry.last_accessed = Some(Utc::now());
        drop(entry);

        counter!("cache_misses_total").increment(1);
        histogram!("cache_lookup_duration_seconds").record(lookup_time.as_secs_f64());
    }

    /// Hit rate for one key as a percentage; 0 for unknown keys.
    pub fn hit_rate(&self, key: &str) -> f64 {
        self.per_key
            .get(key)
            .map(|c| c.hit_rate())
            .unwrap_or(0.0)
    }

    /// Aggregate statistics across all tracked keys.
    pub fn overall_stats(&self) -> OverallStats {
        let mut total_hits = 0;
        let mut total_misses = 0;
        for entry in self.per_key.iter() {
            total_hits += entry.hits;
            total_misses += entry.misses;
        }
        let total = total_hits + total_misses;
        OverallStats {
            total_hits,
            total_misses,
            total_requests: total,
            overall_hit_rate: if total == 0 {
                0.0
            } else {
                (total_hits as f64 / total as f64) * 100.0
            },
            tracked_keys: self.per_key.len(),
        }
    }

    /// Per-key snapshots, unsorted.
    pub fn detailed_metrics(&self) -> Vec<KeyMetrics> {
        self.per_key
            .iter()
            .map(|entry| KeyMetrics {
                key: entry.key().clone(),
                hits: entry.hits,
                misses: entry.misses,
                hit_rate: entry.hit_rate(),
                avg_lookup_micros: entry.avg_lookup_micros(),
                last_accessed: entry.last_accessed,
            })
            .collect()
    }

    /// The `n` keys with the highest hit rate (ties broken by traffic).
    pub fn top_performers(&self, n: usize) -> Vec<KeyMetrics> {
        let mut all = self.detailed_metrics();
        all.sort_by(|a, b| {
            b.hit_rate
                .partial_cmp(&a.hit_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (b.hits + b.misses).cmp(&(a.hits + a.misses)))
        });
        all.truncate(n);
        all
    }

    /// The `n` keys with the lowest hit rate, candidates for TTL tuning.
    pub fn worst_performers(&self, n: usize) -> Vec<KeyMetrics> {
        let mut all = self.detailed_metrics();
        all.sort_by(|a, b| {
            a.hit_rate
                .partial_cmp(&b.hit_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (b.hits + b.misses).cmp(&(a.hits + a.misses)))
        });
        all.truncate(n);
        all
    }

    /// Reset counters for one key.
    pub fn reset(&self, key: &str) {
        self.per_key.remove(key);
    }

    /// Reset all counters.
    pub fn reset_all(&self) {
        self.per_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_reflects_recorded_counts() {
        let metrics = CacheMetrics::new();
        for _ in 0..3 {
            metrics.record_hit("guild:members:1", Duration::from_micros(50));
        }
        metrics.record_miss("guild:members:1", Duration::from_micros(900));

        // 3 hits out of 4 lookups
        assert!((metrics.hit_rate("guild:members:1") - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_key_has_zero_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate("nope"), 0.0);
    }

    #[test]
    fn test_overall_stats_aggregate() {
        let metrics = CacheMetrics::new();
        metrics.record_hit("a", Duration::from_micros(10));
        metrics.record_hit("b", Duration::from_micros(10));
        metrics.record_miss("b", Duration::from_micros(10));
        metrics.record_miss("c", Duration::from_micros(10));

        let stats = metrics.overall_stats();
        assert_eq!(stats.total_hits, 2);
        assert_eq!(stats.total_misses, 2);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.tracked_keys, 3);
        assert!((stats.overall_hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_performer_rankings() {
        let metrics = CacheMetrics::new();
        metrics.record_hit("hot", Duration::from_micros(10));
        metrics.record_hit("hot", Duration::from_micros(10));
        metrics.record_miss("cold", Duration::from_micros(10));
        metrics.record_hit("warm", Duration::from_micros(10));
        metrics.record_miss("warm", Duration::from_micros(10));

        let top = metrics.top_performers(1);
        assert_eq!(top[0].key, "hot");

        let worst = metrics.worst_performers(1);
        assert_eq!(worst[0].key, "cold");
    }

    #[test]
    fn test_reset_clears_key() {
        let metrics = CacheMetrics::new();
        metrics.record_hit("a", Duration::from_micros(10));
        metrics.reset("a");
        assert_eq!(metrics.hit_rate("a"), 0.0);
        assert_eq!(metrics.overall_stats().tracked_keys, 0);
    }

    #[test]
    fn test_avg_lookup_time() {
        let metrics = CacheMetrics::new();
        metrics.record_hit("a", Duration::from_micros(100));
        metrics.record_miss("a", Duration::from_micros(300));

        let detail = metrics.detailed_metrics();
        let a = detail.iter().find(|m| m.key == "a").unwrap();
        assert!((a.avg_lookup_micros - 200.0).abs() < f64::EPSILON);
    }
}
