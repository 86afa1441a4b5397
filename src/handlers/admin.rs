//! Admin Handlers
//!
//! Role grants and operational cache controls. All routes behind the
//! admin middleware.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{errors::AppError, extractors::AuthUser, AppState};

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRoleRequest {
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateCacheRequest {
    pub pattern: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// GET /api/admin/users/{id}/roles
#[tracing::instrument(skip(state, _admin))]
pub async fn list_roles(
    State(state): State<AppState>,
    _admin: AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let grants = state.auth.get_user_roles(&user_id).await?;
    Ok(Json(json!({ "success": true, "roles": grants })))
}

/// POST /api/admin/users/{id}/roles
#[tracing::instrument(skip(state, admin))]
pub async fn assign_role(
    State(state): State<AppState>,
    admin: AuthUser,
    Path(user_id): Path<String>,
    Json(payload): Json<AssignRoleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Granting the top tier requires role management rights, not just an
    // admin level.
    if payload.role == "super_admin" && !admin.has_permission("role:manage") {
        return Err(AppError::Forbidden(
            "Only super admins can grant super_admin".to_string(),
        ));
    }
    state
        .auth
        .assign_role(&user_id, &payload.role, &admin.user_id, payload.expires_at)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// DELETE /api/admin/users/{id}/roles
#[tracing::instrument(skip(state, _admin))]
pub async fn revoke_role(
    State(state): State<AppState>,
    _admin: AuthUser,
    Path(user_id): Path<String>,
    Json(payload): Json<RevokeRoleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.auth.revoke_role(&user_id, &payload.role).await? {
        return Err(AppError::NotFound("Role grant not found".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

/// POST /api/admin/cache/invalidate
#[tracing::instrument(skip(state, _admin))]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    _admin: AuthUser,
    Json(payload): Json<InvalidateCacheRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let by_tags = if payload.tags.is_empty() {
        None
    } else {
        Some(state.cache.invalidate_by_tags(&payload.tags).await)
    };
    let query_entries = state.db.invalidate_cache(payload.pattern.as_deref()).await;

    Ok(Json(json!({
        "success": true,
        "tags": by_tags,
        "query_entries": query_entries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WarmCacheRequest {
    pub strategy: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// POST /api/admin/cache/warm
#[tracing::instrument(skip(state, _admin))]
pub async fn warm_cache(
    State(state): State<AppState>,
    _admin: AuthUser,
    Json(payload): Json<WarmCacheRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.cache.warm_cache(&payload.strategy, payload.args).await {
        return Err(AppError::ValidationMessage(format!(
            "Warming strategy '{}' failed or does not exist",
            payload.strategy
        )));
    }
    Ok(Json(json!({ "success": true })))
}

/// POST /api/admin/cache/cleanup
#[tracing::instrument(skip(state, _admin))]
pub async fn cleanup_cache(
    State(state): State<AppState>,
    _admin: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let counts = state.cache.cleanup_expired().await;
    Ok(Json(json!({ "success": true, "removed": counts })))
}
