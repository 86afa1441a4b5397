//! Kehilla Directory - Library Root
//!
//! Backend platform for the kosher-establishment directory. The
//! engineering core is the multi-tier cache manager, the consolidated
//! database manager, and the authentication service; everything else
//! consumes their contracts.

use std::sync::Arc;

pub mod auth;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod monitoring;
pub mod responses;
pub mod routes;
pub mod services;

pub use errors::AppError;
pub use responses::ApiResponse;

/// Application state shared across all handlers. Every service is
/// constructed once at startup and injected here; no lazy globals.
#[derive(Clone)]
pub struct AppState {
    /// Consolidated database manager (pool, query pipeline, query cache)
    pub db: Arc<database::DatabaseManager>,
    /// Multi-tier cache manager (L1 memory, L2 Redis, L3 durable)
    pub cache: Arc<cache::CacheManager>,
    /// Authentication service (tokens, sessions, blacklist, step-up)
    pub auth: Arc<auth::AuthService>,
    /// Database health monitor
    pub health: Arc<database::HealthMonitor>,
    /// Rolling metrics and alerting
    pub metrics: Arc<monitoring::MetricsAggregator>,
    /// Shared Redis facade (None when Redis is not configured)
    pub redis: Option<cache::RedisClient>,
    /// Remote JWKS registry for RS256-verified tokens
    pub jwks: Option<Arc<auth::jwks::JwksRegistry>>,
    /// Per-IP login rate limiter
    pub rate_limiter: Arc<middleware::rate_limit::LoginRateLimiter>,
    /// Application configuration
    pub config: Arc<config::AppConfig>,
}
