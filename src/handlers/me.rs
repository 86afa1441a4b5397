//! Current User Handlers (/me)

use axum::{extract::State, Json};
use serde::Deserialize;
use validator::Validate;

use crate::{
    errors::AppError, extractors::AuthUser, handlers::auth::UserResponse,
    responses::ApiResponse, AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 255, message = "Name must be 1-255 characters"))]
    pub name: Option<String>,
}

/// GET /api/me - Get current user profile
#[tracing::instrument(skip(state, user))]
pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<UserResponse>>, AppError> {
    let profile = state
        .auth
        .get_user_profile(&user.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found".to_string()))?;
    Ok(Json(ApiResponse::success((&profile).into())))
}

/// PUT /api/me - Update current user profile
#[tracing::instrument(skip(state, user, payload))]
pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ApiResponse<UserResponse>>, AppError> {
    payload.validate()?;
    let profile = state
        .auth
        .update_user_profile(&user.user_id, payload.name.as_deref())
        .await?;
    Ok(Json(ApiResponse::success((&profile).into())))
}
