//! L3 Durable Cache Tier
//!
//! Single-table KV in Postgres for expensive, long-lived artifacts that
//! should survive a Redis restart. Expired rows are invisible to reads
//! and purged by the periodic cleanup task.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};

const TABLE: &str = "query_result_cache";

/// One row of the durable tier.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DurableCacheRecord {
    pub cache_key: String,
    pub cache_value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: i32,
    pub last_accessed: DateTime<Utc>,
    pub tags: Vec<String>,
    pub size_bytes: i32,
}

impl DurableCacheRecord {
    /// Deserialize the stored payload; None for corrupted rows.
    pub fn decode(&self) -> Option<Value> {
        serde_json::from_slice(&self.cache_value).ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DurableCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate_percent: f64,
    pub total_entries: i64,
    pub total_size_bytes: i64,
    pub expired_entries: i64,
}

/// L3 tier. Failures degrade to miss/false and bump the error counter.
pub struct DurableCache {
    pool: PgPool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl DurableCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Idempotent table/index bootstrap for deployments that run ahead of
    /// the migration set.
    pub async fn ensure_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                cache_key     VARCHAR(255) PRIMARY KEY,
                cache_value   BYTEA NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at    TIMESTAMPTZ,
                access_count  INTEGER NOT NULL DEFAULT 0,
                last_accessed TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                tags          TEXT[] NOT NULL DEFAULT '{{}}',
                size_bytes    INTEGER NOT NULL DEFAULT 0
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON {TABLE}(expires_at)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_cache_tags ON {TABLE} USING GIN(tags)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON {TABLE}(last_accessed)"
        ))
        .execute(&self.pool)
        .await?;
        tracing::info!("durable cache table ensured");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let record = sqlx::query_as::<_, DurableCacheRecord>(&format!(
            "SELECT cache_key, cache_value, created_at, expires_at,
                    access_count, last_accessed, tags, size_bytes
             FROM {TABLE}
             WHERE cache_key = $1 AND (expires_at IS NULL OR expires_at > NOW())"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await;

        match record {
            Ok(Some(record)) => {
                // Best-effort access bump; a failure here does not turn a
                // hit into a miss.
                if let Err(e) = sqlx::query(&format!(
                    "UPDATE {TABLE}
                     SET access_count = access_count + 1, last_accessed = NOW()
                     WHERE cache_key = $1"
                ))
                .bind(key)
                .execute(&self.pool)
                .await
                {
                    tracing::debug!(key, error = %e, "durable cache access bump failed");
                }
                match record.decode() {
                    Some(value) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(value)
                    }
                    None => {
                        tracing::warn!(key, "undecodable durable cache row");
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        self.delete(key).await;
                        None
                    }
                }
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "durable cache GET failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Value, ttl_secs: Option<u64>, tags: &[String]) -> bool {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to serialize durable cache value");
                return false;
            }
        };
        let size_bytes = raw.len() as i32;
        let expires_at = ttl_secs.map(|ttl| Utc::now() + Duration::seconds(ttl as i64));

        let result = sqlx::query(&format!(
            "INSERT INTO {TABLE}
                 (cache_key, cache_value, expires_at, tags, size_bytes, created_at, last_accessed)
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
             ON CONFLICT (cache_key)
             DO UPDATE SET
                 cache_value = EXCLUDED.cache_value,
                 expires_at = EXCLUDED.expires_at,
                 tags = EXCLUDED.tags,
                 size_bytes = EXCLUDED.size_bytes,
                 last_accessed = NOW()"
        ))
        .bind(key)
        .bind(raw)
        .bind(expires_at)
        .bind(tags)
        .bind(size_bytes)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "durable cache SET failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match sqlx::query(&format!("DELETE FROM {TABLE} WHERE cache_key = $1"))
            .bind(key)
            .execute(&self.pool)
            .await
        {
            Ok(done) => done.rows_affected() > 0,
            Err(e) => {
                tracing::warn!(key, error = %e, "durable cache DELETE failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Array-overlap deletion: any row sharing a tag with the argument set.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> u64 {
        match sqlx::query(&format!("DELETE FROM {TABLE} WHERE tags && $1"))
            .bind(tags)
            .execute(&self.pool)
            .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::warn!(error = %e, "durable cache tag invalidation failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Delete every row whose key contains the given fragment.
    pub async fn delete_matching(&self, fragment: &str) -> u64 {
        match sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE cache_key LIKE '%' || $1 || '%'"
        ))
        .bind(fragment)
        .execute(&self.pool)
        .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::warn!(error = %e, "durable cache pattern delete failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn cleanup_expired(&self) -> u64 {
        match sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE expires_at IS NOT NULL AND expires_at < NOW()"
        ))
        .execute(&self.pool)
        .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::warn!(error = %e, "durable cache cleanup failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn clear(&self) -> u64 {
        match sqlx::query(&format!("DELETE FROM {TABLE}"))
            .execute(&self.pool)
            .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                tracing::warn!(error = %e, "durable cache clear failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn stats(&self) -> DurableCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let (total_entries, total_size_bytes, expired_entries) = match sqlx::query(&format!(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(size_bytes), 0)::BIGINT AS size,
                    COUNT(*) FILTER (WHERE expires_at IS NOT NULL AND expires_at < NOW()) AS expired
             FROM {TABLE}"
        ))
        .fetch_one(&self.pool)
        .await
        {
            Ok(row) => (
                row.get::<i64, _>("total"),
                row.get::<i64, _>("size"),
                row.get::<i64, _>("expired"),
            ),
            Err(_) => (0, 0, 0),
        };

        DurableCacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate_percent: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total_entries,
            total_size_bytes,
            expired_entries,
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}
