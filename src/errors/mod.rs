//! Application Error Handling
//!
//! Errors are classified and propagated by kind, not by type name. Each
//! variant maps to one of the authoritative kinds: validation,
//! authentication, authorization, rate_limited, not_found, conflict,
//! service_unavailable, internal.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use validator::ValidationErrors;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // =========================================================================
    // Authentication Errors (401)
    // =========================================================================
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    // =========================================================================
    // Authorization Errors (403)
    // =========================================================================
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // Rate Limiting (429)
    // =========================================================================
    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    // =========================================================================
    // Resource Errors (4xx)
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // =========================================================================
    // Validation Errors (422)
    // =========================================================================
    #[error("Validation failed")]
    Validation(#[from] ValidationErrors),

    #[error("Validation error: {0}")]
    ValidationMessage(String),

    /// Password-policy failure carrying the violated rules.
    #[error("Password requirements not met")]
    PasswordPolicy { issues: Vec<String> },

    // =========================================================================
    // Infrastructure Errors (5xx)
    // =========================================================================
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transient infrastructure failure; the caller may retry.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    // =========================================================================
    // Internal Errors (5xx)
    // =========================================================================
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Authoritative error kind, stable across variants.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_)
            | AppError::InvalidCredentials
            | AppError::TokenExpired
            | AppError::InvalidToken => "authentication",
            AppError::Forbidden(_) => "authorization",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_)
            | AppError::Validation(_)
            | AppError::ValidationMessage(_)
            | AppError::PasswordPolicy { .. } => "validation",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Database(e) => {
                if is_transient_db_error(e) {
                    "service_unavailable"
                } else {
                    "internal"
                }
            }
            AppError::Internal(_) | AppError::Anyhow(_) => "internal",
        }
    }
}

/// Connection-level failures are transient; everything else (constraint
/// violations, decode errors, schema mismatch) is permanent.
pub fn is_transient_db_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, error_message, details, retry_after) = match &self {
            // Authentication errors surface one opaque message; never
            // distinguish "user not found" from "bad password" externally.
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, msg.clone(), None, None)
            }
            AppError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "Invalid email or password".to_string(),
                None,
                None,
            ),
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "Token has expired".to_string(),
                None,
                None,
            ),
            AppError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "Invalid token".to_string(),
                None,
                None,
            ),

            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone(), None, None),

            AppError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests".to_string(),
                None,
                Some(*retry_after_secs),
            ),

            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None, None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None, None),

            AppError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation failed".to_string(),
                Some(format_validation_errors(errors)),
                None,
            ),
            AppError::ValidationMessage(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), None, None)
            }
            AppError::PasswordPolicy { issues } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Password requirements not met".to_string(),
                Some(json!({ "password": issues })),
                None,
            ),

            // Database errors - log but don't expose internals
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                if is_transient_db_error(e) {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Database temporarily unavailable".to_string(),
                        None,
                        Some(1),
                    )
                } else {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "A database error occurred".to_string(),
                        None,
                        None,
                    )
                }
            }

            AppError::ServiceUnavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                    None,
                    Some(1),
                )
            }

            // Internal errors - log but don't expose internals
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    None,
                    None,
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Unexpected error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred".to_string(),
                    None,
                    None,
                )
            }
        };

        let mut body = json!({
            "success": false,
            "error": kind,
            "message": error_message,
        });
        if let Some(d) = details {
            body["errors"] = d;
        }
        if let Some(secs) = retry_after {
            body["retryable"] = json!(true);
            body["retry_after"] = json!(secs);
        }

        (status, Json(body)).into_response()
    }
}

/// Flatten validator output into a field → messages map.
fn format_validation_errors(errors: &ValidationErrors) -> serde_json::Value {
    let mut error_map = serde_json::Map::new();

    for (field, field_errors) in errors.field_errors() {
        let messages: Vec<String> = field_errors
            .iter()
            .map(|e| {
                e.message
                    .clone()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for {}", field))
            })
            .collect();

        error_map.insert(field.to_string(), json!(messages));
    }

    serde_json::Value::Object(error_map)
}

/// Result type alias for handlers
pub type HandlerResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AppError::InvalidCredentials.kind(), "authentication");
        assert_eq!(AppError::Forbidden("x".into()).kind(), "authorization");
        assert_eq!(
            AppError::RateLimited { retry_after_secs: 5 }.kind(),
            "rate_limited"
        );
        assert_eq!(AppError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(AppError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(AppError::ValidationMessage("x".into()).kind(), "validation");
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).kind(),
            "service_unavailable"
        );
        assert_eq!(AppError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_db_error(&sqlx::Error::RowNotFound));
    }
}
