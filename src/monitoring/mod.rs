//! Runtime monitoring
//!
//! Passive observers with pull endpoints: rolling metric series with
//! percentile derivations and threshold alerts.

pub mod metrics;

pub use metrics::{Alert, AlertSeverity, Comparator, MetricsAggregator};
