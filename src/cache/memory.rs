//! L1 In-Memory Cache
//!
//! Bounded in-process LRU. Entries carry a TTL, a tag set, and the byte
//! size of their canonical JSON serialization; eviction runs until both
//! the entry cap and the byte cap hold. A single lock guards the whole
//! structure, and no operation performs I/O while holding it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// One cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub tags: HashSet<String>,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryCacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub bytes_used: usize,
    pub bytes_max: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
}

struct MemoryCacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Access order, least-recently-used at the front.
    order: VecDeque<String>,
    current_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl MemoryCacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.current_bytes -= entry.size_bytes;
            Some(entry)
        } else {
            None
        }
    }
}

/// L1 tier. Safe for concurrent use; all methods take `&self`.
pub struct MemoryCache {
    max_entries: usize,
    max_bytes: usize,
    inner: RwLock<MemoryCacheInner>,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_memory_mb: usize) -> Self {
        Self {
            max_entries,
            max_bytes: max_memory_mb * 1024 * 1024,
            inner: RwLock::new(MemoryCacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                current_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            inner.remove_entry(key);
            inner.misses += 1;
            return None;
        }

        let value = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                entry.value.clone()
            }
            None => {
                inner.misses += 1;
                return None;
            }
        };
        inner.touch(key);
        inner.hits += 1;
        Some(value)
    }

    /// Insert a value. Returns false only when the value cannot be sized
    /// (serialization failure) or can never fit the byte cap.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
        tags: &[String],
    ) -> bool {
        let size_bytes = match serde_json::to_vec(&value) {
            Ok(raw) => raw.len(),
            Err(e) => {
                tracing::warn!(key, error = %e, "rejecting unserializable L1 value");
                return false;
            }
        };
        if size_bytes > self.max_bytes {
            return false;
        }

        let now = Utc::now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: ttl_secs.map(|ttl| now + Duration::seconds(ttl as i64)),
            last_accessed: now,
            access_count: 0,
            tags: tags.iter().cloned().collect(),
            size_bytes,
        };

        let mut inner = self.inner.write().await;
        inner.remove_entry(key);

        // Evict from the LRU end until both caps hold.
        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_entries
                || inner.current_bytes + entry.size_bytes > self.max_bytes)
        {
            if let Some(oldest) = inner.order.front().cloned() {
                inner.remove_entry(&oldest);
                inner.evictions += 1;
            } else {
                break;
            }
        }

        inner.current_bytes += entry.size_bytes;
        inner.entries.insert(key.to_string(), entry);
        inner.order.push_back(key.to_string());
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.write().await.remove_entry(key).is_some()
    }

    /// Remove every entry carrying any of the given tags. The full scan is
    /// acceptable at L1 size.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> u64 {
        let mut inner = self.inner.write().await;
        let matching: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| tags.iter().any(|t| entry.tags.contains(t)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            inner.remove_entry(key);
        }
        matching.len() as u64
    }

    /// Remove every entry whose key contains the given fragment.
    pub async fn delete_matching(&self, fragment: &str) -> u64 {
        let mut inner = self.inner.write().await;
        let matching: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| key.contains(fragment))
            .cloned()
            .collect();
        for key in &matching {
            inner.remove_entry(key);
        }
        matching.len() as u64
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
        inner.current_bytes = 0;
    }

    pub async fn stats(&self) -> MemoryCacheStats {
        let inner = self.inner.read().await;
        let total = inner.hits + inner.misses;
        MemoryCacheStats {
            size: inner.entries.len(),
            max_entries: self.max_entries,
            bytes_used: inner.current_bytes,
            bytes_max: self.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate_percent: if total > 0 {
                inner.hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub async fn reset_stats(&self) {
        let mut inner = self.inner.write().await;
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn get_returns_what_set_stored() {
        let cache = MemoryCache::new(10, 1);
        assert!(cache.set("k", json!({"x": 1}), Some(60), &[]).await);
        assert_eq!(cache.get("k").await, Some(json!({"x": 1})));
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_unreachable() {
        let cache = MemoryCache::new(10, 1);
        assert!(cache.set("k", json!(1), Some(0), &[]).await);
        assert!(cache.get("k").await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn entry_cap_evicts_least_recently_used() {
        let cache = MemoryCache::new(2, 1);
        cache.set("a", json!(1), None, &[]).await;
        cache.set("b", json!(2), None, &[]).await;
        // Touch "a" so "b" becomes the LRU victim.
        cache.get("a").await;
        cache.set("c", json!(3), None, &[]).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn byte_cap_holds_after_every_set() {
        // 1 MB cap; each value is ~100 KB, so at most 10 fit.
        let cache = MemoryCache::new(1000, 1);
        for i in 0..20 {
            let blob = "x".repeat(100 * 1024);
            assert!(cache.set(&format!("k{i}"), json!(blob), None, &[]).await);
            let stats = cache.stats().await;
            assert!(stats.bytes_used <= stats.bytes_max);
        }
        assert!(cache.stats().await.evictions > 0);
    }

    #[tokio::test]
    async fn oversized_value_is_rejected() {
        let cache = MemoryCache::new(10, 1);
        let blob = "x".repeat(2 * 1024 * 1024);
        assert!(!cache.set("big", json!(blob), None, &[]).await);
    }

    #[tokio::test]
    async fn tag_invalidation_removes_only_matches() {
        let cache = MemoryCache::new(10, 1);
        cache.set("a", json!(1), None, &["g".into()]).await;
        cache.set("b", json!(2), None, &["g".into()]).await;
        cache.set("c", json!(3), None, &["h".into()]).await;

        assert_eq!(cache.invalidate_by_tags(&["g".into()]).await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
        assert_eq!(cache.get("c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn overwrite_replaces_byte_accounting() {
        let cache = MemoryCache::new(10, 1);
        cache.set("k", json!("x".repeat(1000)), None, &[]).await;
        let before = cache.stats().await.bytes_used;
        cache.set("k", json!("y"), None, &[]).await;
        let after = cache.stats().await.bytes_used;
        assert!(after < before);
        assert_eq!(cache.stats().await.size, 1);
    }
}
