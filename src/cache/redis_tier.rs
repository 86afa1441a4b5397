//! L2 Redis Tier
//!
//! Distributed cache tier over the Redis facade. Tag support rides on a
//! companion `<key>:meta` entry written with the same TTL as the value;
//! tag invalidation scans the meta keys and deletes matching pairs.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use super::redis_client::RedisClient;

#[derive(Debug, Clone, Serialize)]
pub struct RedisTierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate_percent: f64,
}

/// L2 tier. All failures count as misses or `false`; a Redis outage never
/// aborts a read-through.
pub struct RedisTierCache {
    client: RedisClient,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisTierCache {
    pub const PREFIX: &'static str = "l2_cache:";

    pub fn new(client: &RedisClient) -> Self {
        Self {
            client: client.with_prefix(Self::PREFIX),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.client.get_json(key).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Value, ttl_secs: Option<u64>, tags: &[String]) -> bool {
        if !tags.is_empty() {
            let meta = json!({
                "tags": tags,
                "created_at": Utc::now().to_rfc3339(),
            });
            // Meta shares the value's TTL so it can never outlive it.
            self.client
                .set_json(&format!("{key}:meta"), &meta, ttl_secs)
                .await;
        }
        self.client.set_json(key, value, ttl_secs).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.client.delete(&format!("{key}:meta")).await;
        self.client.delete(key).await
    }

    /// Scan all meta companions, inspect tag sets, delete matching pairs.
    /// O(number of tagged keys); acceptable for this load profile.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> u64 {
        let meta_keys = self.client.scan_keys("*:meta").await;
        let mut removed = 0u64;
        for meta_key in meta_keys {
            let Some(meta) = self.client.get_json(&meta_key).await else {
                continue;
            };
            let matched = meta
                .get("tags")
                .and_then(Value::as_array)
                .map(|entry_tags| {
                    entry_tags
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|t| tags.iter().any(|wanted| wanted == t))
                })
                .unwrap_or(false);
            if matched {
                let key = meta_key.trim_end_matches(":meta").to_string();
                if self.delete(&key).await {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Delete every key containing the given fragment.
    pub async fn delete_matching(&self, fragment: &str) -> u64 {
        self.client.delete_pattern(&format!("*{fragment}*")).await
    }

    pub async fn clear(&self) -> u64 {
        self.client.delete_pattern("*").await
    }

    pub fn stats(&self) -> RedisTierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RedisTierStats {
            hits,
            misses,
            errors: self.client.stats().errors,
            hit_rate_percent: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
