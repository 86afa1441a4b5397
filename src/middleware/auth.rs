//! Authentication Middleware
//!
//! Resolves the bearer token (Authorization header or the `access_token`
//! cookie), verifies it through the auth service (signature, claims, and
//! blacklist), and stashes the principal in request extensions.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::{errors::AppError, extractors::AuthUser, AppState};

/// Pull the token from `Authorization: Bearer …`, falling back to the
/// auth cookie.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(token) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == "access_token").then(|| value.to_string())
            })
        })
}

/// Middleware to require authentication.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(&request)
        .ok_or(AppError::Unauthorized("Missing authorization token".into()))?;

    let principal = match state.auth.verify_access(&token).await {
        Ok(claims) => AuthUser {
            user_id: claims.uid,
            email: claims.email,
            sid: claims.sid,
            fid: claims.fid,
            roles: claims.roles.unwrap_or_default(),
            permissions: claims.permissions.unwrap_or_default(),
        },
        // Tokens minted by the external identity provider verify against
        // the JWKS registry instead.
        Err(local_err) => match &state.jwks {
            Some(jwks) => match jwks.verify(&token, None).await {
                Some(payload) => remote_principal(&payload).ok_or(local_err)?,
                None => return Err(local_err),
            },
            None => return Err(local_err),
        },
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Build a principal from a remote RS256 payload. Remote tokens carry no
/// session lineage; session-scoped operations see empty ids.
fn remote_principal(payload: &serde_json::Value) -> Option<AuthUser> {
    let user_id = payload.get("sub")?.as_str()?.to_string();
    let email = payload
        .get("email")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let role = payload
        .get("role")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(crate::auth::roles::ROLE_USER);
    let roles = vec![crate::models::RoleGrant::new(
        role,
        crate::auth::roles::role_level(role),
    )];
    let permissions = crate::auth::roles::resolve_permissions(&roles);
    Some(AuthUser {
        user_id,
        email,
        sid: String::new(),
        fid: String::new(),
        roles,
        permissions,
    })
}

/// Middleware to require an admin-level role. The attempted operation and
/// the subject's roles are logged for audit; the caller sees one message.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AppError::Unauthorized("Authentication required".into()))?;

    if !user.is_admin() {
        tracing::warn!(
            target: "security",
            user_id = %user.user_id,
            roles = ?user.roles,
            path = %request.uri().path(),
            "admin access denied"
        );
        return Err(AppError::Forbidden("Admin access required".into()));
    }

    Ok(next.run(request).await)
}
