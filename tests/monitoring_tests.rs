//! Monitoring surface tests

use std::collections::HashMap;

use kehilla_directory_api::monitoring::{Alert, AlertSeverity, Comparator, MetricsAggregator};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn default_alert_set_covers_the_documented_thresholds() {
    let aggregator = MetricsAggregator::new().with_default_alerts().await;

    let mut values = HashMap::new();
    values.insert("cpu_percent".to_string(), 81.0);
    values.insert("memory_percent".to_string(), 86.0);
    values.insert("response_time_avg_ms".to_string(), 2001.0);
    values.insert("error_rate_percent".to_string(), 6.0);
    values.insert("cache_hit_rate_percent".to_string(), 69.0);

    let mut triggered: Vec<String> = aggregator
        .check_alerts_with(&values)
        .await
        .into_iter()
        .map(|e| e.alert_id)
        .collect();
    triggered.sort();

    assert_eq!(
        triggered,
        vec![
            "high_cpu",
            "high_error_rate",
            "high_memory",
            "low_cache_hit_rate",
            "slow_response"
        ]
    );
}

#[tokio::test]
async fn boundary_values_do_not_trigger() {
    let aggregator = MetricsAggregator::new().with_default_alerts().await;

    let mut values = HashMap::new();
    values.insert("cpu_percent".to_string(), 80.0);
    values.insert("memory_percent".to_string(), 85.0);
    values.insert("response_time_avg_ms".to_string(), 2000.0);
    values.insert("error_rate_percent".to_string(), 5.0);
    values.insert("cache_hit_rate_percent".to_string(), 70.0);

    assert!(aggregator.check_alerts_with(&values).await.is_empty());
}

#[tokio::test]
async fn custom_alert_lifecycle() {
    let aggregator = MetricsAggregator::new();
    aggregator
        .add_alert(Alert::new(
            "slow_queries",
            "slow_query_count",
            Comparator::Gte,
            10.0,
            AlertSeverity::Medium,
            "Too many slow queries",
        ))
        .await;

    let mut values = HashMap::new();
    values.insert("slow_query_count".to_string(), 12.0);
    let events = aggregator.check_alerts_with(&values).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "alert_triggered");

    values.insert("slow_query_count".to_string(), 3.0);
    let events = aggregator.check_alerts_with(&values).await;
    assert_eq!(events[0].kind, "alert_resolved");

    aggregator.remove_alert("slow_queries").await;
    values.insert("slow_query_count".to_string(), 100.0);
    assert!(aggregator.check_alerts_with(&values).await.is_empty());
}

#[tokio::test]
async fn request_recording_feeds_percentiles() {
    let aggregator = MetricsAggregator::new();
    for i in 1..=100 {
        aggregator.record_request(i as f64, false).await;
    }
    let summary = aggregator.summary("response_time_ms").await.unwrap();
    assert_eq!(summary.count, 100);
    assert_eq!(summary.p95, 95.0);
    assert_eq!(summary.p99, 99.0);
    assert!((summary.avg - 50.5).abs() < f64::EPSILON);
}
