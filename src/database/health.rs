//! Connection Health Monitor
//!
//! Probes the pool on an interval: a plain `SELECT 1`, the same through a
//! transaction, and a pool-state sample. Classifies the result and keeps a
//! rolling history for the summary endpoint.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::HealthSettings;

use super::manager::{ConnectionPoolState, DatabaseManager};

/// History retention depth.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_state: Option<ConnectionPoolState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: &'static str,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: f64,
    pub recent_status_counts: std::collections::HashMap<&'static str, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub total_checks: usize,
}

struct MonitorState {
    history: VecDeque<HealthRecord>,
    consecutive_failures: u32,
}

pub struct HealthMonitor {
    settings: HealthSettings,
    state: RwLock<MonitorState>,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(MonitorState {
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                consecutive_failures: 0,
            }),
        }
    }

    /// One full probe against the given pool. Never panics; a probe that
    /// raises classifies as CRITICAL.
    pub async fn check(&self, db: &DatabaseManager) -> HealthRecord {
        let started = Instant::now();

        let probe = self.probe(db).await;
        let record = match probe {
            Ok(pool_state) => {
                let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                let status = self.classify(response_time_ms, &pool_state);
                if status != HealthStatus::Healthy {
                    tracing::warn!(
                        status = status.as_str(),
                        response_time_ms,
                        invalid = pool_state.invalid,
                        "database health check degraded"
                    );
                }
                HealthRecord {
                    timestamp: Utc::now(),
                    status,
                    response_time_ms: Some(response_time_ms),
                    pool_state: Some(pool_state),
                    error: None,
                    consecutive_failures: 0,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "database health check failed");
                HealthRecord {
                    timestamp: Utc::now(),
                    status: HealthStatus::Critical,
                    response_time_ms: None,
                    pool_state: None,
                    error: Some(e.to_string()),
                    consecutive_failures: 0,
                }
            }
        };

        let mut state = self.state.write().await;
        if record.status == HealthStatus::Healthy {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
        let record = HealthRecord {
            consecutive_failures: state.consecutive_failures,
            ..record
        };
        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(record.clone());
        record
    }

    async fn probe(&self, db: &DatabaseManager) -> Result<ConnectionPoolState, sqlx::Error> {
        // Basic connectivity.
        sqlx::query("SELECT 1").fetch_one(db.pool()).await?;

        // Transactional path: the same statement through a session.
        let mut tx = db.pool().begin().await?;
        sqlx::query("SELECT 1").fetch_one(&mut *tx).await?;
        tx.rollback().await?;

        Ok(db.pool_state())
    }

    /// Classification rules:
    /// - response time over the bound -> DEGRADED
    /// - invalid connections over the bound -> UNHEALTHY (dominates)
    /// - probe error -> CRITICAL (handled by the caller)
    pub fn classify(&self, response_time_ms: f64, pool_state: &ConnectionPoolState) -> HealthStatus {
        let mut status = HealthStatus::Healthy;
        if response_time_ms > self.settings.max_response_time_ms {
            status = HealthStatus::Degraded;
        }
        if pool_state.invalid > self.settings.max_failed_connections {
            status = HealthStatus::Unhealthy;
        }
        status
    }

    pub async fn summary(&self) -> HealthSummary {
        let state = self.state.read().await;
        let now = Utc::now();
        let recent: Vec<&HealthRecord> = state
            .history
            .iter()
            .filter(|r| (now - r.timestamp).num_minutes() < 5)
            .collect();

        let avg_response_time_ms = if recent.is_empty() {
            0.0
        } else {
            recent
                .iter()
                .filter_map(|r| r.response_time_ms)
                .sum::<f64>()
                / recent.len() as f64
        };

        let mut recent_status_counts = std::collections::HashMap::new();
        for record in &recent {
            *recent_status_counts.entry(record.status.as_str()).or_insert(0) += 1;
        }

        HealthSummary {
            status: state
                .history
                .back()
                .map(|r| r.status.as_str())
                .unwrap_or("unknown"),
            consecutive_failures: state.consecutive_failures,
            avg_response_time_ms,
            recent_status_counts,
            last_check: state.history.back().map(|r| r.timestamp),
            total_checks: state.history.len(),
        }
    }

    /// Periodic probe loop; stops when the shutdown signal flips.
    pub fn spawn(
        self: Arc<Self>,
        db: Arc<DatabaseManager>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let record = self.check(&db).await;
                        tracing::debug!(
                            status = record.status.as_str(),
                            response_time_ms = record.response_time_ms,
                            "health check completed"
                        );
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("health monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthSettings {
            check_interval_secs: 30,
            max_response_time_ms: 1000.0,
            max_failed_connections: 5,
        })
    }

    fn pool_state(invalid: i64) -> ConnectionPoolState {
        ConnectionPoolState {
            size: 10,
            checked_in: 8,
            checked_out: 2,
            overflow: 0,
            invalid,
        }
    }

    #[test]
    fn fast_probe_with_clean_pool_is_healthy() {
        assert_eq!(
            monitor().classify(20.0, &pool_state(0)),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn slow_probe_is_degraded() {
        assert_eq!(
            monitor().classify(1500.0, &pool_state(0)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn invalid_connections_dominate_slowness() {
        assert_eq!(
            monitor().classify(1500.0, &pool_state(6)),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            monitor().classify(20.0, &pool_state(6)),
            HealthStatus::Unhealthy
        );
    }
}
