//! Consolidated database layer
//!
//! [`manager`] owns the connection pool and the query pipeline,
//! [`query_cache`] fingerprints and caches SELECT results through the
//! multi-tier cache, and [`health`] probes the pool on an interval.

pub mod health;
pub mod manager;
pub mod query_cache;

pub use health::{HealthMonitor, HealthStatus};
pub use manager::{ConnectionPoolState, DatabaseManager};
pub use query_cache::QueryCache;
