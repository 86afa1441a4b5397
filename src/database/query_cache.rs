//! Query-Result Cache
//!
//! Caches SELECT results keyed by a stable fingerprint of the SQL text and
//! its parameters, routed through the multi-tier cache manager. A bounded
//! in-memory fallback keeps hot results available while Redis is down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::CacheManager;

/// Namespace for query-result keys in the shared cache.
const KEY_PREFIX: &str = "query:";

/// One fallback entry; mirrors the durable shape without the storage.
#[derive(Debug, Clone)]
pub struct QueryCacheEntry {
    pub fingerprint: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub hit_count: u64,
}

impl QueryCacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= Duration::seconds(self.ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
    pub fallback_entries: usize,
}

pub struct QueryCache {
    cache: Arc<CacheManager>,
    default_ttl_secs: u64,
    max_fallback_entries: usize,
    fallback: Mutex<HashMap<String, QueryCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(cache: Arc<CacheManager>, default_ttl_secs: u64, max_fallback_entries: usize) -> Self {
        Self {
            cache,
            default_ttl_secs,
            max_fallback_entries,
            fallback: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Stable fingerprint over the SQL text and its parameters: first 16
    /// hex chars of sha256(sql ++ NUL ++ canonical params).
    pub fn fingerprint(sql: &str, params: &[Value]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(&Value::Array(params.to_vec())).as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn key_for(fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }

    pub async fn get(&self, sql: &str, params: &[Value]) -> Option<Value> {
        let fp = Self::fingerprint(sql, params);
        let key = Self::key_for(&fp);

        if let Some(result) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fingerprint = %fp, "query cache hit");
            return Some(result);
        }

        // Tier outage path: the bounded in-process fallback.
        {
            let mut fallback = self.fallback.lock().await;
            let now = Utc::now();
            if let Some(entry) = fallback.get_mut(&fp) {
                if !entry.is_expired(now) {
                    entry.hit_count += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(fingerprint = %fp, "query cache fallback hit");
                    return Some(entry.result.clone());
                }
                fallback.remove(&fp);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn set(&self, sql: &str, params: &[Value], result: Value, ttl_secs: Option<u64>) {
        let fp = Self::fingerprint(sql, params);
        let key = Self::key_for(&fp);
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);

        let stored = self.cache.set(&key, result.clone(), Some(ttl), &[]).await;
        self.sets.fetch_add(1, Ordering::Relaxed);

        if !stored {
            // Some tier is down; keep the result reachable in process.
            let mut fallback = self.fallback.lock().await;
            if fallback.len() >= self.max_fallback_entries {
                self.evict_oldest(&mut fallback);
            }
            fallback.insert(
                fp.clone(),
                QueryCacheEntry {
                    fingerprint: fp,
                    result,
                    created_at: Utc::now(),
                    ttl_secs: ttl,
                    hit_count: 0,
                },
            );
        }
    }

    /// Drop the oldest quarter of the fallback to amortize eviction cost.
    fn evict_oldest(&self, fallback: &mut HashMap<String, QueryCacheEntry>) {
        let mut by_age: Vec<(String, DateTime<Utc>)> = fallback
            .iter()
            .map(|(k, entry)| (k.clone(), entry.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);
        let to_remove = (self.max_fallback_entries / 4).max(1);
        for (key, _) in by_age.into_iter().take(to_remove) {
            fallback.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Invalidate cached results whose key contains the fragment; when no
    /// fragment is given, the whole query namespace goes.
    pub async fn invalidate(&self, fragment: Option<&str>) -> u64 {
        let scoped = match fragment {
            Some(f) => format!("{KEY_PREFIX}{f}"),
            None => KEY_PREFIX.to_string(),
        };
        let counts = self.cache.invalidate_pattern(&scoped).await;

        let mut fallback = self.fallback.lock().await;
        match fragment {
            Some(f) => fallback.retain(|fp, _| !fp.contains(f)),
            None => fallback.clear(),
        }

        tracing::info!(pattern = %scoped, removed = counts.total(), "query cache invalidated");
        counts.total()
    }

    pub async fn stats(&self) -> QueryCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        QueryCacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate_percent: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            fallback_entries: self.fallback.lock().await.len(),
        }
    }
}

/// Deterministic JSON rendering: object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_at_every_depth() {
        let a = json!({"b": 1, "a": {"z": 2, "y": 3}});
        let b = json!({"a": {"y": 3, "z": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn fingerprint_is_stable_and_param_sensitive() {
        let params = vec![json!("dairy"), json!(10)];
        let fp1 = QueryCache::fingerprint("SELECT * FROM restaurants WHERE kosher_category = $1", &params);
        let fp2 = QueryCache::fingerprint("SELECT * FROM restaurants WHERE kosher_category = $1", &params);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 16);

        let other = QueryCache::fingerprint(
            "SELECT * FROM restaurants WHERE kosher_category = $1",
            &[json!("meat"), json!(10)],
        );
        assert_ne!(fp1, other);
    }

    #[test]
    fn fingerprint_distinguishes_sql_text() {
        let fp1 = QueryCache::fingerprint("SELECT 1", &[]);
        let fp2 = QueryCache::fingerprint("SELECT 2", &[]);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn fallback_entry_expiry() {
        let entry = QueryCacheEntry {
            fingerprint: "f".into(),
            result: json!([]),
            created_at: Utc::now() - Duration::seconds(10),
            ttl_secs: 5,
            hit_count: 0,
        };
        assert!(entry.is_expired(Utc::now()));
        let fresh = QueryCacheEntry {
            created_at: Utc::now(),
            ..entry
        };
        assert!(!fresh.is_expired(Utc::now()));
    }
}
