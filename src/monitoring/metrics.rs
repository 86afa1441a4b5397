//! Metrics Aggregator
//!
//! Rolling in-memory series (request counts, latencies, error rates, cache
//! hit rate, query times, system gauges) with avg/p95/p99 derivations and
//! threshold alerts. Alerts trigger when their condition holds against a
//! freshly computed value and resolve when it no longer does. Notification
//! fans out to registered sinks; a failing sink is logged and bypassed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Samples per series; at one sample a second this covers well over the
/// alert evaluation window.
const MAX_SAMPLES_PER_SERIES: usize = 1024;

/// Window over which "current" metric values are computed.
const EVALUATION_WINDOW_SECS: i64 = 60;

/// Alert event history bound.
const MAX_ALERT_HISTORY: usize = 1000;

// =============================================================================
// Series
// =============================================================================

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl Series {
    fn push(&mut self, at: DateTime<Utc>, value: f64) {
        if self.samples.len() >= MAX_SAMPLES_PER_SERIES {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
    }

    fn recent(&self, now: DateTime<Utc>, window_secs: i64) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|(at, _)| now - *at < Duration::seconds(window_secs))
            .map(|(_, v)| *v)
            .collect()
    }
}

/// Percentile over a sample set; linear index on the sorted values.
pub fn percentile(samples: &[f64], pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub count: usize,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
    pub latest: f64,
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Gte => value >= threshold,
            Comparator::Lte => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            comparator,
            threshold,
            severity,
            message: message.into(),
            is_active: false,
            triggered_at: None,
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: &'static str,
    pub alert_id: String,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Notification target for alert transitions.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, event: &AlertEvent) -> Result<(), String>;
}

/// Default sink: structured log lines.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<(), String> {
        match event.kind {
            "alert_triggered" => tracing::warn!(
                alert = %event.alert_id,
                metric = %event.metric,
                value = event.value,
                threshold = event.threshold,
                severity = ?event.severity,
                "{}",
                event.message
            ),
            _ => tracing::info!(
                alert = %event.alert_id,
                metric = %event.metric,
                value = event.value,
                "alert resolved"
            ),
        }
        Ok(())
    }
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct MetricsAggregator {
    series: RwLock<HashMap<String, Series>>,
    alerts: RwLock<HashMap<String, Alert>>,
    alert_history: RwLock<VecDeque<AlertEvent>>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            alert_history: RwLock::new(VecDeque::new()),
            sinks: RwLock::new(vec![Arc::new(TracingAlertSink)]),
        }
    }

    /// The default alert set wired at startup.
    pub async fn with_default_alerts(self) -> Self {
        let defaults = [
            Alert::new(
                "high_cpu",
                "cpu_percent",
                Comparator::Gt,
                80.0,
                AlertSeverity::High,
                "CPU usage above 80%",
            ),
            Alert::new(
                "high_memory",
                "memory_percent",
                Comparator::Gt,
                85.0,
                AlertSeverity::High,
                "Memory usage above 85%",
            ),
            Alert::new(
                "slow_response",
                "response_time_avg_ms",
                Comparator::Gt,
                2000.0,
                AlertSeverity::Medium,
                "Average response time above 2s",
            ),
            Alert::new(
                "high_error_rate",
                "error_rate_percent",
                Comparator::Gt,
                5.0,
                AlertSeverity::High,
                "Error rate above 5%",
            ),
            Alert::new(
                "low_cache_hit_rate",
                "cache_hit_rate_percent",
                Comparator::Lt,
                70.0,
                AlertSeverity::Medium,
                "Cache hit rate below 70%",
            ),
        ];
        {
            let mut alerts = self.alerts.write().await;
            for alert in defaults {
                alerts.insert(alert.id.clone(), alert);
            }
        }
        self
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    pub async fn record(&self, metric: &str, value: f64) {
        let mut series = self.series.write().await;
        series
            .entry(metric.to_string())
            .or_default()
            .push(Utc::now(), value);
    }

    /// One request observation: latency plus error flag, feeding the
    /// derived series the default alerts evaluate.
    pub async fn record_request(&self, duration_ms: f64, is_error: bool) {
        let now = Utc::now();
        let mut series = self.series.write().await;
        series
            .entry("response_time_ms".to_string())
            .or_default()
            .push(now, duration_ms);
        series
            .entry("request_count".to_string())
            .or_default()
            .push(now, 1.0);
        if is_error {
            series
                .entry("error_count".to_string())
                .or_default()
                .push(now, 1.0);
        }
    }

    // -------------------------------------------------------------------------
    // Derivations
    // -------------------------------------------------------------------------

    pub async fn summary(&self, metric: &str) -> Option<SeriesSummary> {
        let series = self.series.read().await;
        let samples = series.get(metric)?.recent(Utc::now(), EVALUATION_WINDOW_SECS);
        if samples.is_empty() {
            return None;
        }
        Some(SeriesSummary {
            count: samples.len(),
            avg: samples.iter().sum::<f64>() / samples.len() as f64,
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
            latest: samples.last().copied().unwrap_or(0.0),
        })
    }

    /// Freshly computed current values, one per series, plus the derived
    /// metrics the default alerts reference.
    pub async fn compute_current(&self) -> HashMap<String, f64> {
        let now = Utc::now();
        let series = self.series.read().await;
        let mut current = HashMap::new();

        for (name, s) in series.iter() {
            let recent = s.recent(now, EVALUATION_WINDOW_SECS);
            if recent.is_empty() {
                continue;
            }
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            current.insert(name.clone(), avg);
        }

        // Derived: average latency under its alert alias, and error rate.
        if let Some(avg) = current.get("response_time_ms").copied() {
            current.insert("response_time_avg_ms".to_string(), avg);
        }
        let requests = series
            .get("request_count")
            .map(|s| s.recent(now, EVALUATION_WINDOW_SECS).len())
            .unwrap_or(0);
        let errors = series
            .get("error_count")
            .map(|s| s.recent(now, EVALUATION_WINDOW_SECS).len())
            .unwrap_or(0);
        if requests > 0 {
            current.insert(
                "error_rate_percent".to_string(),
                errors as f64 / requests as f64 * 100.0,
            );
        }
        current
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    pub async fn add_alert(&self, alert: Alert) {
        tracing::info!(alert = %alert.id, metric = %alert.metric, "alert registered");
        self.alerts.write().await.insert(alert.id.clone(), alert);
    }

    pub async fn remove_alert(&self, id: &str) {
        if self.alerts.write().await.remove(id).is_some() {
            tracing::info!(alert = id, "alert removed");
        }
    }

    pub async fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Evaluate every alert against the current values; emit transitions.
    pub async fn check_alerts(&self) -> Vec<AlertEvent> {
        let current = self.compute_current().await;
        self.check_alerts_with(&current).await
    }

    pub async fn check_alerts_with(&self, values: &HashMap<String, f64>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        {
            let mut alerts = self.alerts.write().await;
            for alert in alerts.values_mut() {
                let Some(&value) = values.get(&alert.metric) else {
                    continue;
                };
                let firing = alert.comparator.holds(value, alert.threshold);
                let now = Utc::now();
                if firing && !alert.is_active {
                    alert.is_active = true;
                    alert.triggered_at = Some(now);
                    alert.resolved_at = None;
                    events.push(AlertEvent {
                        kind: "alert_triggered",
                        alert_id: alert.id.clone(),
                        metric: alert.metric.clone(),
                        threshold: alert.threshold,
                        value,
                        severity: alert.severity,
                        message: alert.message.clone(),
                        timestamp: now,
                    });
                } else if !firing && alert.is_active {
                    alert.is_active = false;
                    alert.resolved_at = Some(now);
                    events.push(AlertEvent {
                        kind: "alert_resolved",
                        alert_id: alert.id.clone(),
                        metric: alert.metric.clone(),
                        threshold: alert.threshold,
                        value,
                        severity: alert.severity,
                        message: alert.message.clone(),
                        timestamp: now,
                    });
                }
            }
        }

        if !events.is_empty() {
            let mut history = self.alert_history.write().await;
            for event in &events {
                if history.len() >= MAX_ALERT_HISTORY {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }

            let sinks = self.sinks.read().await.clone();
            for event in &events {
                for sink in &sinks {
                    if let Err(e) = sink.notify(event).await {
                        tracing::error!(sink = sink.name(), error = %e, "alert sink failed");
                    }
                }
            }
        }
        events
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let mut summaries = serde_json::Map::new();
        {
            let names: Vec<String> = self.series.read().await.keys().cloned().collect();
            for name in names {
                if let Some(summary) = self.summary(&name).await {
                    summaries.insert(name, serde_json::to_value(summary).unwrap_or_default());
                }
            }
        }
        serde_json::json!({
            "series": summaries,
            "active_alerts": self.active_alerts().await,
            "timestamp": Utc::now(),
        })
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn percentiles_from_sorted_rank() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 95.0), 95.0);
        assert_eq!(percentile(&samples, 99.0), 99.0);
        assert_eq!(percentile(&samples, 50.0), 50.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[42.0], 99.0), 42.0);
    }

    #[test]
    fn comparators() {
        assert!(Comparator::Gt.holds(81.0, 80.0));
        assert!(!Comparator::Gt.holds(80.0, 80.0));
        assert!(Comparator::Gte.holds(80.0, 80.0));
        assert!(Comparator::Lt.holds(60.0, 70.0));
        assert!(Comparator::Lte.holds(70.0, 70.0));
        assert!(Comparator::Eq.holds(5.0, 5.0));
    }

    #[tokio::test]
    async fn alert_triggers_then_resolves() {
        let aggregator = MetricsAggregator::new().with_default_alerts().await;

        let mut values = HashMap::new();
        values.insert("cpu_percent".to_string(), 95.0);
        let events = aggregator.check_alerts_with(&values).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "alert_triggered");
        assert_eq!(events[0].alert_id, "high_cpu");
        assert_eq!(aggregator.active_alerts().await.len(), 1);

        // Still firing: no duplicate event.
        let events = aggregator.check_alerts_with(&values).await;
        assert!(events.is_empty());

        values.insert("cpu_percent".to_string(), 40.0);
        let events = aggregator.check_alerts_with(&values).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "alert_resolved");
        assert!(aggregator.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn low_cache_hit_rate_uses_lt() {
        let aggregator = MetricsAggregator::new().with_default_alerts().await;
        let mut values = HashMap::new();
        values.insert("cache_hit_rate_percent".to_string(), 50.0);
        let events = aggregator.check_alerts_with(&values).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alert_id, "low_cache_hit_rate");
    }

    #[tokio::test]
    async fn error_rate_derivation() {
        let aggregator = MetricsAggregator::new();
        for i in 0..10 {
            aggregator.record_request(100.0, i == 0).await;
        }
        let current = aggregator.compute_current().await;
        assert_eq!(current.get("error_rate_percent"), Some(&10.0));
        assert_eq!(current.get("response_time_avg_ms"), Some(&100.0));
    }

    #[tokio::test]
    async fn summary_reports_percentiles() {
        let aggregator = MetricsAggregator::new();
        for v in 1..=100 {
            aggregator.record("db_query_time_ms", v as f64).await;
        }
        let summary = aggregator.summary("db_query_time_ms").await.unwrap();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
        assert_eq!(summary.latest, 100.0);
    }
}
