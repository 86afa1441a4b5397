//! Cache Performance Metrics
//!
//! Counters shared by the tier manager plus a bounded rolling sample of
//! operation durations for the running latency average.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::durable::DurableCacheStats;
use super::memory::MemoryCacheStats;
use super::redis_tier::RedisTierStats;

/// Rolling sample bound for operation durations.
const MAX_OPERATION_SAMPLES: usize = 1000;

#[derive(Debug)]
pub struct CacheMetrics {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub cache_writes: u64,
    pub cache_invalidations: u64,
    pub cache_warming_operations: u64,
    pub total_operations: u64,
    pub last_reset: DateTime<Utc>,
    operation_times_ms: Vec<f64>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self {
            l1_hits: 0,
            l1_misses: 0,
            l2_hits: 0,
            l2_misses: 0,
            l3_hits: 0,
            l3_misses: 0,
            cache_writes: 0,
            cache_invalidations: 0,
            cache_warming_operations: 0,
            total_operations: 0,
            last_reset: Utc::now(),
            operation_times_ms: Vec::new(),
        }
    }
}

impl CacheMetrics {
    pub fn record_operation_time(&mut self, duration_ms: f64) {
        self.operation_times_ms.push(duration_ms);
        if self.operation_times_ms.len() > MAX_OPERATION_SAMPLES {
            let excess = self.operation_times_ms.len() - MAX_OPERATION_SAMPLES;
            self.operation_times_ms.drain(..excess);
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.operation_times_ms.is_empty() {
            return 0.0;
        }
        self.operation_times_ms.iter().sum::<f64>() / self.operation_times_ms.len() as f64
    }

    /// Overall hit rate across tiers, as a percentage.
    pub fn overall_hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits + self.l3_hits;
        let total = hits + self.l1_misses + self.l2_misses + self.l3_misses;
        if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn hit_rate(&self, tier: CacheTier) -> f64 {
        let (hits, misses) = match tier {
            CacheTier::L1 => (self.l1_hits, self.l1_misses),
            CacheTier::L2 => (self.l2_hits, self.l2_misses),
            CacheTier::L3 => (self.l3_hits, self.l3_misses),
        };
        let total = hits + misses;
        if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

/// Serializable snapshot exposed by the manager's metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub cache_writes: u64,
    pub cache_invalidations: u64,
    pub cache_warming_operations: u64,
    pub total_operations: u64,
    pub average_response_time_ms: f64,
    pub overall_hit_rate_percent: f64,
    pub last_reset: DateTime<Utc>,
    pub l1: MemoryCacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2: Option<RedisTierStats>,
    pub l3: DurableCacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_samples_stay_bounded() {
        let mut metrics = CacheMetrics::default();
        for i in 0..2500 {
            metrics.record_operation_time(i as f64);
        }
        assert!(metrics.average_response_time_ms() > 0.0);
        assert_eq!(metrics.operation_times_ms.len(), MAX_OPERATION_SAMPLES);
        // Oldest samples were dropped, so the first retained one is 1500.
        assert_eq!(metrics.operation_times_ms[0], 1500.0);
    }

    #[test]
    fn overall_hit_rate_spans_tiers() {
        let mut metrics = CacheMetrics::default();
        metrics.l1_hits = 2;
        metrics.l2_hits = 1;
        metrics.l3_hits = 1;
        metrics.l1_misses = 2;
        metrics.l2_misses = 1;
        metrics.l3_misses = 1;
        // 4 hits / 8 observations.
        assert_eq!(metrics.overall_hit_rate(), 50.0);
        assert_eq!(metrics.hit_rate(CacheTier::L1), 50.0);
    }

    #[test]
    fn empty_metrics_report_zero() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.overall_hit_rate(), 0.0);
        assert_eq!(metrics.average_response_time_ms(), 0.0);
    }
}
