//! Health and Metrics Handlers
//!
//! Kubernetes probes plus the pull endpoints for database health, cache
//! metrics, and the rolling metrics aggregator.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::json;

use crate::{errors::AppError, responses::ApiResponse, AppState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub redis: &'static str,
}

/// GET /api/health/live - is the application alive?
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Application is running",
    })
}

/// GET /api/health/ready - is the application ready to serve traffic?
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_status = if state.db.is_connected().await {
        "connected"
    } else {
        "disconnected"
    };

    let redis_status = match &state.redis {
        Some(redis) => {
            if redis.ping().await {
                "connected"
            } else {
                "disconnected"
            }
        }
        None => "not_configured",
    };

    let all_healthy = db_status == "connected";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if all_healthy { "ready" } else { "not_ready" },
            database: db_status,
            redis: redis_status,
        }),
    )
}

/// GET /api/health/db - full database health check
#[tracing::instrument(skip(state))]
pub async fn db_health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.db.health_check(&state.health).await))
}

/// GET /api/health/performance - database performance metrics
#[tracing::instrument(skip(state))]
pub async fn performance(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.db.performance_metrics().await))
}

/// GET /api/health/cache - multi-tier cache metrics
#[tracing::instrument(skip(state))]
pub async fn cache_metrics(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<crate::cache::CacheMetricsSnapshot>>, AppError> {
    Ok(Json(ApiResponse::success(state.cache.metrics().await)))
}

/// GET /api/health/metrics - rolling metrics and active alerts
#[tracing::instrument(skip(state))]
pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot().await)
}

/// GET /api/health/optimization - pool utilization report
#[tracing::instrument(skip(state))]
pub async fn optimization(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pool": state.db.optimize_connection_pool(),
    }))
}
