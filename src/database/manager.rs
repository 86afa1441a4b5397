//! Consolidated Database Manager
//!
//! Owns the Postgres pool and every query that crosses it: scoped
//! transactional sessions, the execute-query pipeline with result caching
//! and slow-query accounting, pool state snapshots, and cache
//! invalidation. Server-side statement and idle-in-transaction timeouts
//! are applied to every pooled connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, Transaction};

use crate::config::DatabaseSettings;
use crate::errors::{is_transient_db_error, AppError};

use super::query_cache::QueryCache;

/// Statement classification for metrics and cache routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryKind {
    pub fn classify(sql: &str) -> Self {
        let head = sql.trim_start().get(..6).unwrap_or("").to_ascii_uppercase();
        if head.starts_with("SELECT") {
            QueryKind::Select
        } else if head.starts_with("INSERT") {
            QueryKind::Insert
        } else if head.starts_with("UPDATE") {
            QueryKind::Update
        } else if head.starts_with("DELETE") {
            QueryKind::Delete
        } else {
            QueryKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Select => "select",
            QueryKind::Insert => "insert",
            QueryKind::Update => "update",
            QueryKind::Delete => "delete",
            QueryKind::Other => "other",
        }
    }
}

/// Read-only pool snapshot consumed by health and metrics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionPoolState {
    pub size: i64,
    pub checked_in: i64,
    pub checked_out: i64,
    pub overflow: i64,
    pub invalid: i64,
}

#[derive(Debug, Default)]
struct DbCounters {
    total_queries: AtomicU64,
    cached_queries: AtomicU64,
    slow_queries: AtomicU64,
    failed_queries: AtomicU64,
    total_response_time_us: AtomicU64,
    connection_errors: AtomicU64,
    checkouts: AtomicU64,
    checkins: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatsSnapshot {
    pub total_queries: u64,
    pub cached_queries: u64,
    pub slow_queries: u64,
    pub failed_queries: u64,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub connection_errors: u64,
    pub connects: u64,
    pub checkouts: u64,
    pub checkins: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolOptimizationReport {
    pub current_size: i64,
    pub checked_out: i64,
    pub overflow: i64,
    pub utilization: f64,
    pub recommendation: String,
}

pub struct DatabaseManager {
    settings: DatabaseSettings,
    pool: PgPool,
    query_cache: Arc<QueryCache>,
    slow_query_threshold_secs: f64,
    counters: DbCounters,
    connects: Arc<AtomicU64>,
}

/// Build the pool the manager will own. Split out so the pool can be
/// shared with the cache tiers before the manager itself exists.
pub async fn build_pool(settings: &DatabaseSettings) -> Result<(PgPool, Arc<AtomicU64>), sqlx::Error> {
    let connects = Arc::new(AtomicU64::new(0));
    let counter = connects.clone();
    let statement_timeout_ms = settings.statement_timeout_ms;
    let idle_in_transaction_timeout_ms = settings.idle_in_transaction_timeout_ms;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections())
        .min_connections(settings.pool_size)
        .acquire_timeout(settings.pool_timeout())
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(settings.pool_recycle())
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!(
                    "SET idle_in_transaction_session_timeout = {idle_in_transaction_timeout_ms}"
                ))
                .execute(&mut *conn)
                .await?;
                tracing::debug!("new database connection established");
                Ok(())
            })
        })
        .connect(&settings.url)
        .await?;

    Ok((pool, connects))
}

impl DatabaseManager {
    pub fn new(
        pool: PgPool,
        connects: Arc<AtomicU64>,
        settings: DatabaseSettings,
        slow_query_threshold_secs: f64,
        query_cache: Arc<QueryCache>,
    ) -> Self {
        Self {
            settings,
            pool,
            query_cache,
            slow_query_threshold_secs,
            counters: DbCounters::default(),
            connects,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    /// Verify connectivity with a bounded round trip. Fails loud at
    /// startup when the database is unreachable or misconfigured.
    pub async fn connect(&self) -> Result<(), sqlx::Error> {
        let probe = sqlx::query("SELECT 1").execute(&self.pool);
        tokio::time::timeout(
            Duration::from_secs(self.settings.connect_timeout_secs),
            probe,
        )
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)??;
        tracing::info!("database connection established");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.pool.close().await;
        tracing::info!("database connection pool closed");
    }

    pub async fn is_connected(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Scoped transactional session: commit on a clean exit, rollback on
    /// error. The transaction never escapes the closure.
    pub async fn session_scope<T, F>(&self, work: F) -> Result<T, AppError>
    where
        F: for<'t> FnOnce(
            &'t mut Transaction<'static, Postgres>,
        )
            -> Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 't>>,
    {
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        let mut tx = self.pool.begin().await.map_err(|e| {
            self.note_connection_error(&e);
            AppError::Database(e)
        })?;

        let result = work(&mut tx).await;
        let outcome = match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        };
        self.counters.checkins.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Raw transaction handle for flows that need row locks across
    /// multiple statements (refresh rotation).
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        self.pool.begin().await.map_err(|e| {
            self.note_connection_error(&e);
            AppError::Database(e)
        })
    }

    // =========================================================================
    // Query pipeline
    // =========================================================================

    /// Execute a statement with caching and performance accounting.
    /// SELECT results are normalized to keyed JSON records; writes return
    /// a single `{"rows_affected": n}` record.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        use_cache: bool,
        cache_ttl: Option<u64>,
    ) -> Result<Vec<Value>, AppError> {
        let kind = QueryKind::classify(sql);

        if use_cache && kind == QueryKind::Select {
            if let Some(Value::Array(rows)) = self.query_cache.get(sql, params).await {
                self.counters.cached_queries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(query = %query_shape(sql), "query served from cache");
                return Ok(rows);
            }
        }

        let started = Instant::now();
        let mut result = self.run_statement(sql, params, kind).await;

        // Transient failures on idempotent reads get one retry with jitter.
        if let Err(ref e) = result {
            if kind == QueryKind::Select && is_transient_db_error(e) {
                let jitter_ms = rand::thread_rng().gen_range(25..100);
                tracing::warn!(
                    query = %query_shape(sql),
                    error = %e,
                    retry_in_ms = jitter_ms,
                    "transient failure, retrying read once"
                );
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                result = self.run_statement(sql, params, kind).await;
            }
        }

        let duration = started.elapsed();
        match result {
            Ok(rows) => {
                self.record_success(sql, kind, duration);
                if use_cache && kind == QueryKind::Select {
                    self.query_cache
                        .set(sql, params, Value::Array(rows.clone()), cache_ttl)
                        .await;
                }
                Ok(rows)
            }
            Err(e) => {
                self.counters.failed_queries.fetch_add(1, Ordering::Relaxed);
                self.note_connection_error(&e);
                tracing::error!(
                    query = %query_shape(sql),
                    query_type = kind.as_str(),
                    error = %e,
                    "query execution failed"
                );
                Err(AppError::Database(e))
            }
        }
    }

    async fn run_statement(
        &self,
        sql: &str,
        params: &[Value],
        kind: QueryKind,
    ) -> Result<Vec<Value>, sqlx::Error> {
        if self.settings.echo {
            tracing::debug!(query = %query_shape(sql), "executing statement");
        }
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        let result = if kind == QueryKind::Select {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_value(query, param);
            }
            query.fetch_all(&self.pool).await.map(|rows| rows_to_json(&rows))
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_value(query, param);
            }
            query
                .execute(&self.pool)
                .await
                .map(|done| vec![json!({ "rows_affected": done.rows_affected() })])
        };
        self.counters.checkins.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn record_success(&self, sql: &str, kind: QueryKind, duration: Duration) {
        self.counters.total_queries.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_response_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration.as_secs_f64() > self.slow_query_threshold_secs {
            self.counters.slow_queries.fetch_add(1, Ordering::Relaxed);
            // Log the query shape only; parameter values may hold secrets.
            tracing::warn!(
                duration_ms = duration.as_secs_f64() * 1000.0,
                query_type = kind.as_str(),
                query = %query_shape(sql),
                "slow query detected"
            );
        }
    }

    fn note_connection_error(&self, e: &sqlx::Error) {
        if is_transient_db_error(e) {
            self.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // Cache control
    // =========================================================================

    /// Invalidate cached query results; `pattern` scopes by key fragment,
    /// `None` clears the whole namespace.
    pub async fn invalidate_cache(&self, pattern: Option<&str>) -> u64 {
        self.query_cache.invalidate(pattern).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn pool_state(&self) -> ConnectionPoolState {
        let size = self.pool.size() as i64;
        let checked_in = self.pool.num_idle() as i64;
        ConnectionPoolState {
            size,
            checked_in,
            checked_out: size - checked_in,
            overflow: (size - self.settings.pool_size as i64).max(0),
            invalid: self.counters.connection_errors.load(Ordering::Relaxed) as i64,
        }
    }

    pub fn stats(&self) -> DbStatsSnapshot {
        let total = self.counters.total_queries.load(Ordering::Relaxed);
        let failed = self.counters.failed_queries.load(Ordering::Relaxed);
        let total_time_us = self.counters.total_response_time_us.load(Ordering::Relaxed);
        let all = total + failed;
        DbStatsSnapshot {
            total_queries: total,
            cached_queries: self.counters.cached_queries.load(Ordering::Relaxed),
            slow_queries: self.counters.slow_queries.load(Ordering::Relaxed),
            failed_queries: failed,
            avg_response_time_ms: if total > 0 {
                total_time_us as f64 / total as f64 / 1000.0
            } else {
                0.0
            },
            error_rate: if all > 0 {
                failed as f64 / all as f64
            } else {
                0.0
            },
            connection_errors: self.counters.connection_errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            checkins: self.counters.checkins.load(Ordering::Relaxed),
        }
    }

    pub async fn performance_metrics(&self) -> Value {
        json!({
            "database_stats": self.stats(),
            "cache_stats": self.query_cache.stats().await,
            "connection_pool": self.pool_state(),
            "timestamp": Utc::now(),
        })
    }

    /// One-shot health report: a fresh probe plus pool, performance, and
    /// cache statistics.
    pub async fn health_check(&self, monitor: &super::health::HealthMonitor) -> Value {
        let record = monitor.check(self).await;
        json!({
            "status": record.status.as_str(),
            "timestamp": record.timestamp,
            "response_time_ms": record.response_time_ms,
            "connection_pool": record.pool_state,
            "consecutive_failures": record.consecutive_failures,
            "health_monitor": monitor.summary().await,
            "performance": self.stats(),
            "cache": self.query_cache.stats().await,
        })
    }

    /// Utilization report. sqlx pools are fixed-size once built, so this
    /// recommends rather than resizes.
    pub fn optimize_connection_pool(&self) -> PoolOptimizationReport {
        let state = self.pool_state();
        let utilization = if state.size > 0 {
            state.checked_out as f64 / state.size as f64
        } else {
            0.0
        };
        let recommendation = if utilization > 0.8 {
            let target = ((state.size as f64 * 1.5) as i64).min(50);
            format!("high utilization; consider raising DB_POOL_SIZE toward {target}")
        } else if utilization < 0.3 && state.size > 5 {
            let target = ((state.size as f64 * 0.8) as i64).max(5);
            format!("low utilization; consider lowering DB_POOL_SIZE toward {target}")
        } else {
            "pool size appropriate for current load".to_string()
        };

        tracing::info!(
            size = state.size,
            checked_out = state.checked_out,
            overflow = state.overflow,
            utilization,
            "pool optimization evaluated"
        );

        PoolOptimizationReport {
            current_size: state.size,
            checked_out: state.checked_out,
            overflow: state.overflow,
            utilization,
            recommendation,
        }
    }
}

/// Bind one JSON parameter with its natural SQL type.
fn bind_value<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.clone()),
    }
}

/// Normalize driver rows to keyed JSON records.
fn rows_to_json(rows: &[PgRow]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut record = serde_json::Map::new();
            for (idx, column) in row.columns().iter().enumerate() {
                record.insert(column.name().to_string(), column_to_json(row, idx));
            }
            Value::Object(record)
        })
        .collect()
}

/// Decode one column into JSON, falling through the common Postgres types.
fn column_to_json(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<Utc>>, _>(idx) {
        return v.map(|dt| Value::from(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|dt| Value::from(dt.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::from(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    Value::Null
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Collapse a statement to its shape for logging: whitespace folded,
/// truncated, parameters left as placeholders.
pub fn query_shape(sql: &str) -> String {
    let collapsed = WHITESPACE.replace_all(sql.trim(), " ");
    if collapsed.chars().count() > 120 {
        let head: String = collapsed.chars().take(120).collect();
        format!("{head}…")
    } else {
        collapsed.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classification_is_case_and_whitespace_insensitive() {
        assert_eq!(QueryKind::classify("SELECT 1"), QueryKind::Select);
        assert_eq!(QueryKind::classify("  select *"), QueryKind::Select);
        assert_eq!(QueryKind::classify("insert into t"), QueryKind::Insert);
        assert_eq!(QueryKind::classify("UPDATE t SET x=1"), QueryKind::Update);
        assert_eq!(QueryKind::classify("delete from t"), QueryKind::Delete);
        assert_eq!(QueryKind::classify("BEGIN"), QueryKind::Other);
        assert_eq!(QueryKind::classify(""), QueryKind::Other);
    }

    #[test]
    fn query_shape_collapses_and_truncates() {
        let shape = query_shape("SELECT *\n  FROM   users\n  WHERE id = $1");
        assert_eq!(shape, "SELECT * FROM users WHERE id = $1");

        let long = format!("SELECT {} FROM t", "x, ".repeat(100));
        assert!(query_shape(&long).len() <= 124);
    }
}
