//! Session Management Handlers
//!
//! Self-service listing and revocation of a user's refresh sessions.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppError,
    extractors::AuthUser,
    responses::{ApiResponse, EmptyResponse},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub sid: String,
    pub fid: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub created_at: String,
    pub last_used: String,
    pub expires_at: String,
    pub current: bool,
}

#[derive(Debug, Deserialize)]
pub struct RevokeAllRequest {
    #[serde(default)]
    pub keep_current: bool,
}

/// GET /api/auth/sessions
#[tracing::instrument(skip(state, user))]
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<SessionResponse>>>, AppError> {
    let sessions = state.auth.list_sessions(&user.user_id).await?;
    let response: Vec<SessionResponse> = sessions
        .into_iter()
        .map(|s| SessionResponse {
            current: s.sid == user.sid,
            sid: s.sid,
            fid: s.fid,
            user_agent: s.user_agent,
            ip: s.ip,
            created_at: s.created_at.to_rfc3339(),
            last_used: s.last_used.to_rfc3339(),
            expires_at: s.expires_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(ApiResponse::success(response)))
}

/// DELETE /api/auth/sessions/{sid}
#[tracing::instrument(skip(state, user))]
pub async fn revoke(
    State(state): State<AppState>,
    user: AuthUser,
    Path(sid): Path<String>,
) -> Result<Json<EmptyResponse>, AppError> {
    if !state.auth.revoke_session(&user.user_id, &sid).await? {
        return Err(AppError::NotFound("Session not found".to_string()));
    }
    Ok(Json(EmptyResponse::with_message("Session revoked")))
}

/// POST /api/auth/sessions/revoke-all
#[tracing::instrument(skip(state, user))]
pub async fn revoke_all(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Option<Json<RevokeAllRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let keep_current = payload.map(|Json(p)| p.keep_current).unwrap_or(false);
    let except = keep_current.then_some(user.sid.as_str());
    let revoked = state.auth.revoke_all_sessions(&user.user_id, except).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "revoked": revoked
    })))
}
