//! Auth Audit Log
//!
//! Append-only trail of authentication events. Writing is best-effort: an
//! audit failure is logged but never fails the operation being audited.

use serde_json::Value;
use sqlx::PgPool;

pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(
        &self,
        user_id: Option<&str>,
        action: &str,
        ip: Option<&str>,
        success: bool,
        details: Value,
    ) {
        let result = sqlx::query(
            "INSERT INTO auth_audit_log (user_id, action, ip, success, details, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(user_id)
        .bind(action)
        .bind(ip)
        .bind(success)
        .bind(details)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(action, error = %e, "failed to write auth audit event");
        }
    }
}
