//! Multi-Tier Cache Manager
//!
//! Orchestrates the three tiers: read-through L1 -> L2 -> L3 with upward
//! repopulation, write-through across every tier, tag invalidation fanout,
//! named warming strategies, and rolling metrics. A failing tier degrades
//! to a miss or `false`; it never surfaces an error to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};

use super::durable::DurableCache;
use super::memory::MemoryCache;
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::redis_client::RedisClient;
use super::redis_tier::RedisTierCache;

/// Per-tier TTL ladder; short in memory, longer in Redis, longest on disk.
#[derive(Debug, Clone, Copy)]
pub struct TierTtls {
    pub l1_secs: u64,
    pub l2_secs: u64,
    pub l3_secs: u64,
}

impl Default for TierTtls {
    fn default() -> Self {
        Self {
            l1_secs: 300,
            l2_secs: 1800,
            l3_secs: 3600,
        }
    }
}

/// Per-tier counts returned by invalidation and cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.l1 + self.l2 + self.l3
    }
}

/// A registered warming strategy: given caller args, pre-populates some
/// slice of the cache and reports how many entries it loaded.
pub type WarmingFuture = Pin<Box<dyn Future<Output = Result<u64, String>> + Send>>;
pub type WarmingStrategy = Arc<dyn Fn(Value) -> WarmingFuture + Send + Sync>;

pub struct CacheManager {
    l1: MemoryCache,
    l2: Option<RedisTierCache>,
    l3: DurableCache,
    ttls: TierTtls,
    metrics: Mutex<CacheMetrics>,
    warming: RwLock<HashMap<String, WarmingStrategy>>,
}

impl CacheManager {
    pub fn new(
        l1_max_entries: usize,
        l1_max_memory_mb: usize,
        redis: Option<&RedisClient>,
        pool: PgPool,
    ) -> Self {
        Self {
            l1: MemoryCache::new(l1_max_entries, l1_max_memory_mb),
            l2: redis.map(RedisTierCache::new),
            l3: DurableCache::new(pool),
            ttls: TierTtls::default(),
            metrics: Mutex::new(CacheMetrics::default()),
            warming: RwLock::new(HashMap::new()),
        }
    }

    /// Bootstrap the durable tier's table. Called once at startup.
    pub async fn initialize(&self) -> Result<(), sqlx::Error> {
        self.l3.ensure_table().await
    }

    // =========================================================================
    // Read / write / delete
    // =========================================================================

    /// Read-through get. Probes L1, then L2, then L3, repopulating upper
    /// tiers on the way back. Returns None when no tier holds the key.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let start = Instant::now();
        {
            let mut m = self.metrics.lock().await;
            m.total_operations += 1;
        }

        if let Some(value) = self.l1.get(key).await {
            let mut m = self.metrics.lock().await;
            m.l1_hits += 1;
            m.record_operation_time(elapsed_ms(start));
            return Some(value);
        }
        self.metrics.lock().await.l1_misses += 1;

        if let Some(l2) = &self.l2 {
            if let Some(value) = l2.get(key).await {
                self.l1
                    .set(key, value.clone(), Some(self.ttls.l1_secs), &[])
                    .await;
                let mut m = self.metrics.lock().await;
                m.l2_hits += 1;
                m.record_operation_time(elapsed_ms(start));
                return Some(value);
            }
        }
        self.metrics.lock().await.l2_misses += 1;

        if let Some(value) = self.l3.get(key).await {
            self.l1
                .set(key, value.clone(), Some(self.ttls.l1_secs), &[])
                .await;
            if let Some(l2) = &self.l2 {
                l2.set(key, &value, Some(self.ttls.l2_secs), &[]).await;
            }
            let mut m = self.metrics.lock().await;
            m.l3_hits += 1;
            m.record_operation_time(elapsed_ms(start));
            return Some(value);
        }

        let mut m = self.metrics.lock().await;
        m.l3_misses += 1;
        m.record_operation_time(elapsed_ms(start));
        None
    }

    /// Read-through get with a caller default.
    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    /// Write-through set. A caller-supplied TTL overrides every tier;
    /// otherwise each tier uses its own default. Success is the AND of
    /// all tiers.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
        tags: &[String],
    ) -> bool {
        let start = Instant::now();
        self.metrics.lock().await.cache_writes += 1;

        let l1_ok = self
            .l1
            .set(
                key,
                value.clone(),
                Some(ttl_secs.unwrap_or(self.ttls.l1_secs)),
                tags,
            )
            .await;
        let l2_ok = match &self.l2 {
            Some(l2) => {
                l2.set(key, &value, Some(ttl_secs.unwrap_or(self.ttls.l2_secs)), tags)
                    .await
            }
            None => false,
        };
        let l3_ok = self
            .l3
            .set(key, &value, Some(ttl_secs.unwrap_or(self.ttls.l3_secs)), tags)
            .await;

        self.metrics
            .lock()
            .await
            .record_operation_time(elapsed_ms(start));
        l1_ok && l2_ok && l3_ok
    }

    /// Delete from every tier; true when any tier held the key.
    pub async fn delete(&self, key: &str) -> bool {
        let l1_ok = self.l1.delete(key).await;
        let l2_ok = match &self.l2 {
            Some(l2) => l2.delete(key).await,
            None => false,
        };
        let l3_ok = self.l3.delete(key).await;
        l1_ok || l2_ok || l3_ok
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Best-effort fanout: a failure in one tier never blocks the others.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> TierCounts {
        self.metrics.lock().await.cache_invalidations += 1;

        let counts = TierCounts {
            l1: self.l1.invalidate_by_tags(tags).await,
            l2: match &self.l2 {
                Some(l2) => l2.invalidate_by_tags(tags).await,
                None => 0,
            },
            l3: self.l3.invalidate_by_tags(tags).await,
        };

        tracing::info!(
            ?tags,
            l1 = counts.l1,
            l2 = counts.l2,
            l3 = counts.l3,
            "invalidated cache entries by tag"
        );
        counts
    }

    /// Delete every entry whose key contains the given fragment, across
    /// all tiers.
    pub async fn invalidate_pattern(&self, fragment: &str) -> TierCounts {
        self.metrics.lock().await.cache_invalidations += 1;
        TierCounts {
            l1: self.l1.delete_matching(fragment).await,
            l2: match &self.l2 {
                Some(l2) => l2.delete_matching(fragment).await,
                None => 0,
            },
            l3: self.l3.delete_matching(fragment).await,
        }
    }

    /// Purge expired rows. L1 expires on access and Redis enforces its own
    /// TTLs, so only the durable tier needs sweeping.
    pub async fn cleanup_expired(&self) -> TierCounts {
        TierCounts {
            l1: 0,
            l2: 0,
            l3: self.l3.cleanup_expired().await,
        }
    }

    /// Drop every entry in every tier.
    pub async fn clear_all(&self) {
        self.l1.clear().await;
        if let Some(l2) = &self.l2 {
            l2.clear().await;
        }
        self.l3.clear().await;
    }

    /// Testing/operations hook: clear specific tiers without touching the
    /// others (read-through verification needs this).
    pub async fn clear_l1(&self) {
        self.l1.clear().await;
    }

    pub async fn clear_l2(&self) {
        if let Some(l2) = &self.l2 {
            l2.clear().await;
        }
    }

    // =========================================================================
    // Warming
    // =========================================================================

    pub async fn register_warming_strategy(&self, name: impl Into<String>, strategy: WarmingStrategy) {
        let name = name.into();
        tracing::info!(strategy = %name, "registered cache warming strategy");
        self.warming.write().await.insert(name, strategy);
    }

    /// Run a named warming strategy. Unknown names and strategy failures
    /// are logged and reported as false.
    pub async fn warm_cache(&self, name: &str, args: Value) -> bool {
        let strategy = match self.warming.read().await.get(name) {
            Some(strategy) => strategy.clone(),
            None => {
                tracing::warn!(strategy = name, "unknown cache warming strategy");
                return false;
            }
        };

        self.metrics.lock().await.cache_warming_operations += 1;
        match strategy(args).await {
            Ok(loaded) => {
                tracing::info!(strategy = name, loaded, "cache warming completed");
                true
            }
            Err(e) => {
                tracing::error!(strategy = name, error = %e, "cache warming failed");
                false
            }
        }
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    pub async fn metrics(&self) -> CacheMetricsSnapshot {
        let m = self.metrics.lock().await;
        CacheMetricsSnapshot {
            l1_hits: m.l1_hits,
            l1_misses: m.l1_misses,
            l2_hits: m.l2_hits,
            l2_misses: m.l2_misses,
            l3_hits: m.l3_hits,
            l3_misses: m.l3_misses,
            cache_writes: m.cache_writes,
            cache_invalidations: m.cache_invalidations,
            cache_warming_operations: m.cache_warming_operations,
            total_operations: m.total_operations,
            average_response_time_ms: m.average_response_time_ms(),
            overall_hit_rate_percent: m.overall_hit_rate(),
            last_reset: m.last_reset,
            l1: self.l1.stats().await,
            l2: self.l2.as_ref().map(|l2| l2.stats()),
            l3: self.l3.stats().await,
        }
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.lock().await = CacheMetrics::default();
        self.l1.reset_stats().await;
        if let Some(l2) = &self.l2 {
            l2.reset_stats();
        }
        self.l3.reset_stats();
        tracing::info!("cache metrics reset");
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
