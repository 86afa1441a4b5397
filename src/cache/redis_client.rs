//! Redis Client Facade
//!
//! Typed get/set/delete/scan over a shared multiplexed connection with key
//! prefixing, per-value TTL, and transparent compression for large values.
//! Every operation is bounded by a client-level timeout and degrades to a
//! miss (reads) or `false` (writes) on failure; Redis being down must never
//! take a request down with it.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;

/// Values above this many serialized bytes are gzip-compressed.
const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Leading byte of every stored value: plain JSON or gzip-wrapped JSON.
const MARKER_PLAIN: u8 = 0x00;
const MARKER_GZIP: u8 = 0x01;

#[derive(Debug, Default)]
pub struct RedisClientStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisClientStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

/// Shared Redis facade. Cloning is cheap; all clones share one multiplexed
/// connection and one stats block.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
    prefix: String,
    compression_threshold: usize,
    op_timeout: Duration,
    stats: std::sync::Arc<RedisClientStats>,
}

impl RedisClient {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            op_timeout: Duration::from_secs(5),
            stats: std::sync::Arc::new(RedisClientStats::default()),
        })
    }

    /// A facade over the same connection with a different key namespace.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            manager: self.manager.clone(),
            prefix: prefix.into(),
            compression_threshold: self.compression_threshold,
            op_timeout: self.op_timeout,
            stats: std::sync::Arc::new(RedisClientStats::default()),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn record_error(&self, op: &str, key: &str, err: &redis::RedisError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, key, error = %err, "redis operation failed");
    }

    pub async fn get_json(&self, key: &str) -> Option<Value> {
        let full = self.full_key(key);
        let mut conn = self.manager.clone();
        let fut = conn.get::<_, Option<Vec<u8>>>(&full);
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(Some(raw))) => match decode_value(&raw) {
                Some(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                None => {
                    // Undecodable payload: treat as a miss and drop the key.
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    let _ = self.delete(key).await;
                    None
                }
            },
            Ok(Ok(None)) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(Err(e)) => {
                self.record_error("get", key, &e);
                None
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, "redis GET timed out");
                None
            }
        }
    }

    pub async fn set_json(&self, key: &str, value: &Value, ttl_secs: Option<u64>) -> bool {
        let raw = match encode_value(value, self.compression_threshold) {
            Some(raw) => raw,
            None => return false,
        };
        let full = self.full_key(key);
        let mut conn = self.manager.clone();
        let result = match ttl_secs {
            Some(ttl) if ttl > 0 => {
                tokio::time::timeout(self.op_timeout, conn.set_ex::<_, _, ()>(&full, raw, ttl))
                    .await
            }
            _ => tokio::time::timeout(self.op_timeout, conn.set::<_, _, ()>(&full, raw)).await,
        };
        match result {
            Ok(Ok(())) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                self.record_error("set", key, &e);
                false
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, "redis SET timed out");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let full = self.full_key(key);
        let mut conn = self.manager.clone();
        match tokio::time::timeout(self.op_timeout, conn.del::<_, u64>(&full)).await {
            Ok(Ok(n)) => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                n > 0
            }
            Ok(Err(e)) => {
                self.record_error("del", key, &e);
                false
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full = self.full_key(key);
        let mut conn = self.manager.clone();
        match tokio::time::timeout(self.op_timeout, conn.exists::<_, bool>(&full)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                self.record_error("exists", key, &e);
                false
            }
            Err(_) => false,
        }
    }

    /// All keys under this facade's prefix matching `pattern` (a glob over
    /// the unprefixed key space). Returned keys are unprefixed.
    pub async fn scan_keys(&self, pattern: &str) -> Vec<String> {
        let full_pattern = self.full_key(pattern);
        let mut conn = self.manager.clone();
        let scan = async {
            let mut found = Vec::new();
            let mut iter = conn.scan_match::<_, String>(&full_pattern).await?;
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            Ok::<_, redis::RedisError>(found)
        };
        match tokio::time::timeout(self.op_timeout, scan).await {
            Ok(Ok(keys)) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
                .collect(),
            Ok(Err(e)) => {
                self.record_error("scan", pattern, &e);
                Vec::new()
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pattern, "redis SCAN timed out");
                Vec::new()
            }
        }
    }

    /// Delete every key matching the glob pattern; returns how many went.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let keys = self.scan_keys(pattern).await;
        let mut removed = 0u64;
        for key in keys {
            if self.delete(&key).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let cmd = redis::cmd("PING");
        let fut = cmd.query_async::<String>(&mut conn);
        matches!(
            tokio::time::timeout(self.op_timeout, fut).await,
            Ok(Ok(ref pong)) if pong == "PONG"
        )
    }

    pub fn stats(&self) -> RedisClientStatsSnapshot {
        RedisClientStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

/// Serialize a value, compressing when it clears the threshold. The first
/// byte records which encoding was used.
fn encode_value(value: &Value, threshold: usize) -> Option<Vec<u8>> {
    let json = match serde_json::to_vec(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize cache value");
            return None;
        }
    };
    if json.len() > threshold {
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
        if encoder.write_all(&json).is_err() {
            return None;
        }
        match encoder.finish() {
            Ok(compressed) => {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(MARKER_GZIP);
                out.extend_from_slice(&compressed);
                Some(out)
            }
            Err(_) => None,
        }
    } else {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(MARKER_PLAIN);
        out.extend_from_slice(&json);
        Some(out)
    }
}

fn decode_value(raw: &[u8]) -> Option<Value> {
    let (marker, body) = raw.split_first()?;
    match *marker {
        MARKER_PLAIN => serde_json::from_slice(body).ok(),
        MARKER_GZIP => {
            let mut decoder = GzDecoder::new(body);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json).ok()?;
            serde_json::from_slice(&json).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn small_values_stay_plain() {
        let value = json!({"x": 1});
        let raw = encode_value(&value, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert_eq!(raw[0], MARKER_PLAIN);
        assert_eq!(decode_value(&raw).unwrap(), value);
    }

    #[test]
    fn large_values_round_trip_compressed() {
        let value = json!({"blob": "a".repeat(4096)});
        let raw = encode_value(&value, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert_eq!(raw[0], MARKER_GZIP);
        assert!(raw.len() < 4096);
        assert_eq!(decode_value(&raw).unwrap(), value);
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert!(decode_value(&[]).is_none());
        assert!(decode_value(&[0x42, 1, 2, 3]).is_none());
    }
}
