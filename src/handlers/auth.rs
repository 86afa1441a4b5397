//! Authentication Handlers
//!
//! Registration, login, refresh rotation, password flows, guest accounts,
//! and step-up challenges. Tokens travel both in the JSON body and as
//! HttpOnly cookies, with a readable CSRF mirror cookie alongside.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::Validate;

use crate::{
    auth::service::{AuthenticatedUser, StepUpChallenge, StepUpMethod, TokenBundle},
    errors::AppError,
    models::RoleGrant,
    responses::ApiResponse,
    AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    pub password_confirmation: String,
    #[validate(length(max = 255, message = "Name is too long"))]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    pub token: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    pub password_confirmation: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpgradeGuestRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StepUpChallengeRequest {
    pub method: StepUpMethod,
    #[serde(default = "default_return_to")]
    pub return_to: String,
}

fn default_return_to() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
    pub roles: Vec<RoleGrant>,
    pub permissions: Vec<String>,
}

impl From<&AuthenticatedUser> for UserResponse {
    fn from(user: &AuthenticatedUser) -> Self {
        Self {
            id: user.user_id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            email_verified: user.email_verified,
            roles: user.roles.clone(),
            permissions: user.permissions.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

fn auth_response(user: &AuthenticatedUser, tokens: &TokenBundle) -> AuthResponse {
    AuthResponse {
        user: user.into(),
        access_token: tokens.access_token.clone(),
        refresh_token: tokens.refresh_token.clone(),
        token_type: tokens.token_type.clone(),
        expires_in: tokens.expires_in,
    }
}

// =============================================================================
// Cookies
// =============================================================================

fn new_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// HttpOnly access/refresh cookies plus the readable CSRF mirror.
fn issue_auth_cookies(jar: CookieJar, tokens: &TokenBundle) -> CookieJar {
    jar.add(
        Cookie::build(("access_token", tokens.access_token.clone()))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(tokens.expires_in)),
    )
    .add(
        Cookie::build(("refresh_token", tokens.refresh_token.clone()))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(tokens.refresh_expires_in)),
    )
    .add(
        Cookie::build(("_csrf_token", new_csrf_token()))
            .http_only(false)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(tokens.refresh_expires_in)),
    )
}

fn clear_auth_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(("access_token", "")).path("/"))
        .remove(Cookie::build(("refresh_token", "")).path("/"))
        .remove(Cookie::build(("_csrf_token", "")).path("/"))
}

fn client_meta(headers: &HeaderMap, addr: &SocketAddr) -> (Option<String>, String) {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (user_agent, addr.ip().to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                (key == name).then(|| value.to_string())
            })
        })
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/auth/register
#[tracing::instrument(skip(state, jar, payload))]
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, CookieJar, Json<ApiResponse<AuthResponse>>), AppError> {
    payload.validate()?;
    if payload.password != payload.password_confirmation {
        return Err(AppError::ValidationMessage("Passwords do not match".to_string()));
    }

    let (user_agent, ip) = client_meta(&headers, &addr);
    let (user, tokens) = state
        .auth
        .register_user(
            &payload.email,
            &payload.password,
            payload.name.as_deref(),
            user_agent.as_deref(),
            Some(&ip),
        )
        .await?;

    let jar = issue_auth_cookies(jar, &tokens);
    Ok((
        StatusCode::CREATED,
        jar,
        Json(ApiResponse::success(auth_response(&user, &tokens))),
    ))
}

/// POST /api/auth/login
#[tracing::instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<ApiResponse<AuthResponse>>), AppError> {
    payload.validate()?;
    let (user_agent, ip) = client_meta(&headers, &addr);

    let user = match state
        .auth
        .authenticate_user(&payload.email, &payload.password, Some(&ip))
        .await?
    {
        Some(user) => user,
        None => {
            state.rate_limiter.record_failure(&ip).await;
            return Err(AppError::InvalidCredentials);
        }
    };
    state.rate_limiter.clear(&ip).await;

    let tokens = state
        .auth
        .generate_tokens(&user, payload.remember_me, user_agent.as_deref(), Some(&ip))
        .await?;

    let jar = issue_auth_cookies(jar, &tokens);
    Ok((jar, Json(ApiResponse::success(auth_response(&user, &tokens)))))
}

/// POST /api/auth/guest
#[tracing::instrument(skip(state, jar))]
pub async fn guest(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(StatusCode, CookieJar, Json<ApiResponse<AuthResponse>>), AppError> {
    let (user_agent, ip) = client_meta(&headers, &addr);
    let (user, tokens) = state
        .auth
        .create_guest_user(user_agent.as_deref(), Some(&ip))
        .await?;

    let jar = issue_auth_cookies(jar, &tokens);
    Ok((
        StatusCode::CREATED,
        jar,
        Json(ApiResponse::success(auth_response(&user, &tokens))),
    ))
}

/// POST /api/auth/logout
#[tracing::instrument(skip(state, jar))]
pub async fn logout(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, Json<serde_json::Value>), AppError> {
    let ip = addr.ip().to_string();

    // Revoke whatever credentials the client presented.
    let access = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| cookie_value(&headers, "access_token"));
    if let Some(token) = access {
        state.auth.invalidate_token(&token, Some(&ip)).await;
    }
    // The refresh cookie also takes its session family down.
    if let Some(token) = cookie_value(&headers, "refresh_token") {
        state.auth.invalidate_token(&token, Some(&ip)).await;
    }

    Ok((
        clear_auth_cookies(jar),
        Json(serde_json::json!({
            "success": true,
            "message": "Logged out successfully"
        })),
    ))
}

/// POST /api/auth/refresh
#[tracing::instrument(skip(state, jar, payload))]
pub async fn refresh_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Option<Json<RefreshTokenRequest>>,
) -> Result<(CookieJar, Json<ApiResponse<TokenBundle>>), AppError> {
    let ip = addr.ip().to_string();
    // Body wins; cookie-only clients send no body at all.
    let refresh = payload
        .and_then(|Json(p)| p.refresh_token)
        .or_else(|| cookie_value(&headers, "refresh_token"))
        .ok_or(AppError::Unauthorized("Missing refresh token".into()))?;

    let tokens = state.auth.refresh_access_token(&refresh, Some(&ip)).await?;
    let jar = issue_auth_cookies(jar, &tokens);
    Ok((jar, Json(ApiResponse::success(tokens))))
}

/// POST /api/auth/forgot-password
#[tracing::instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    payload.validate()?;
    let ip = addr.ip().to_string();
    state.auth.initiate_password_reset(&payload.email, Some(&ip)).await;

    // Always succeed: this endpoint must not reveal which emails exist.
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "If an account exists with that email, a password reset link has been sent."
    })))
}

/// POST /api/auth/reset-password
#[tracing::instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    payload.validate()?;
    if payload.password != payload.password_confirmation {
        return Err(AppError::ValidationMessage("Passwords do not match".to_string()));
    }

    let ip = addr.ip().to_string();
    let reset = state
        .auth
        .reset_password_with_token(&payload.token, &payload.password, Some(&ip))
        .await?;
    if !reset {
        return Err(AppError::ValidationMessage(
            "Invalid or expired reset token".to_string(),
        ));
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Password has been reset successfully."
    })))
}

/// GET /api/auth/verify-email/{token}
#[tracing::instrument(skip(state))]
pub async fn verify_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.auth.verify_email(&token).await? {
        return Err(AppError::ValidationMessage(
            "Invalid or expired verification token".to_string(),
        ));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Email verified successfully."
    })))
}

/// POST /api/auth/change-password (authenticated)
#[tracing::instrument(skip(state, payload, user))]
pub async fn change_password(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user: crate::extractors::AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    payload.validate()?;
    let ip = addr.ip().to_string();
    state
        .auth
        .change_password(
            &user.user_id,
            &payload.current_password,
            &payload.new_password,
            Some(&ip),
        )
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Password changed successfully."
    })))
}

/// POST /api/auth/upgrade (authenticated guest)
#[tracing::instrument(skip(state, payload, user))]
pub async fn upgrade_guest(
    State(state): State<AppState>,
    user: crate::extractors::AuthUser,
    Json(payload): Json<UpgradeGuestRequest>,
) -> Result<Json<ApiResponse<UserResponse>>, AppError> {
    payload.validate()?;
    let upgraded = state
        .auth
        .upgrade_guest_to_email(
            &user.user_id,
            &payload.email,
            &payload.password,
            payload.name.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::success((&upgraded).into())))
}

// =============================================================================
// Step-up challenges
// =============================================================================

/// POST /api/auth/step-up/challenge (authenticated)
#[tracing::instrument(skip(state, user))]
pub async fn create_step_up_challenge(
    State(state): State<AppState>,
    user: crate::extractors::AuthUser,
    Json(payload): Json<StepUpChallengeRequest>,
) -> Result<Json<ApiResponse<StepUpChallenge>>, AppError> {
    let challenge = state
        .auth
        .create_step_up_challenge(&user.user_id, payload.method, &payload.return_to)
        .await?;
    Ok(Json(ApiResponse::success(challenge)))
}

/// GET /api/auth/step-up/{challenge_id} (authenticated)
#[tracing::instrument(skip(state, user))]
pub async fn get_step_up_challenge(
    State(state): State<AppState>,
    user: crate::extractors::AuthUser,
    Path(challenge_id): Path<String>,
) -> Result<Json<ApiResponse<StepUpChallenge>>, AppError> {
    let challenge = state
        .auth
        .get_step_up_challenge(&challenge_id)
        .await
        .filter(|challenge| challenge.user_id == user.user_id)
        .ok_or(AppError::NotFound("Challenge not found".to_string()))?;
    Ok(Json(ApiResponse::success(challenge)))
}

#[derive(Debug, Deserialize)]
pub struct StepUpPasswordRequest {
    pub password: String,
}

/// POST /api/auth/step-up/{challenge_id}/password (authenticated)
#[tracing::instrument(skip(state, user, payload))]
pub async fn verify_step_up_password(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user: crate::extractors::AuthUser,
    Path(challenge_id): Path<String>,
    Json(payload): Json<StepUpPasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ip = addr.ip().to_string();
    let completed = state
        .auth
        .verify_step_up_password(&challenge_id, &user.user_id, &payload.password, Some(&ip))
        .await?;
    if !completed {
        return Err(AppError::Unauthorized("Step-up verification failed".to_string()));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /api/auth/step-up/{challenge_id}/complete (authenticated)
///
/// Only for methods that carry their own proof (mocked WebAuthn, fresh
/// session); password challenges must use the password endpoint.
#[tracing::instrument(skip(state, user))]
pub async fn complete_step_up_challenge(
    State(state): State<AppState>,
    user: crate::extractors::AuthUser,
    Path(challenge_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let completed = state
        .auth
        .complete_step_up_without_password(&challenge_id, &user.user_id, &user.sid)
        .await?;
    if !completed {
        return Err(AppError::NotFound("Challenge not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}
