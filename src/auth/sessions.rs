//! Session Store
//!
//! Persists refresh-token sessions and their rotation families. The heart
//! of refresh is `rotate_or_reject`: a single transaction that locks the
//! session row, revokes it, and inserts its successor in the same family.
//! Any attempt to rotate a missing, expired, or already-revoked session is
//! treated as token reuse and revokes the entire family.

use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::Session;

/// Cryptographically-random 128-bit identifier, hex-encoded.
fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_session_id() -> String {
    new_id()
}

pub fn new_family_id() -> String {
    new_id()
}

/// Outcome of a rotation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The old session was revoked and a successor created in the same
    /// family.
    Rotated { new_sid: String },
    /// The presented session was unusable: reuse suspected, family
    /// revoked.
    ReuseDetected,
}

pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the first session of a new family at login.
    pub async fn persist_initial(
        &self,
        sid: &str,
        fid: &str,
        user_id: &str,
        user_agent: Option<&str>,
        ip: Option<&str>,
        refresh_ttl_secs: i64,
    ) -> Result<(), AppError> {
        let expires_at = Utc::now() + Duration::seconds(refresh_ttl_secs);
        sqlx::query(
            "INSERT INTO auth_sessions (sid, fid, user_id, user_agent, ip, created_at, last_used, expires_at)
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW(), $6)",
        )
        .bind(sid)
        .bind(fid)
        .bind(user_id)
        .bind(user_agent)
        .bind(ip)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rotate a session or detect reuse. The whole decision runs in one
    /// transaction with a row-level write lock on the session row, so two
    /// concurrent presentations of the same refresh token serialize and
    /// the loser sees a revoked row.
    pub async fn rotate_or_reject(
        &self,
        sid: &str,
        fid: &str,
        refresh_ttl_secs: i64,
    ) -> Result<Rotation, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM auth_sessions WHERE sid = $1 AND fid = $2 FOR UPDATE",
            Session::SELECT_COLUMNS
        ))
        .bind(sid)
        .bind(fid)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let session = match row {
            Some(session) if session.is_usable(now) => session,
            _ => {
                // Reuse suspected: cascade-revoke the whole family before
                // rejecting. Never retried.
                let revoked = sqlx::query(
                    "UPDATE auth_sessions SET revoked_at = NOW()
                     WHERE fid = $1 AND revoked_at IS NULL",
                )
                .bind(fid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                tx.commit().await?;
                tracing::warn!(
                    target: "security",
                    fid,
                    sid,
                    revoked_sessions = revoked,
                    "refresh token reuse detected, family revoked"
                );
                return Ok(Rotation::ReuseDetected);
            }
        };

        sqlx::query(
            "UPDATE auth_sessions SET revoked_at = NOW(), last_used = NOW() WHERE sid = $1",
        )
        .bind(sid)
        .execute(&mut *tx)
        .await?;

        let new_sid = new_session_id();
        let expires_at = now + Duration::seconds(refresh_ttl_secs);
        sqlx::query(
            "INSERT INTO auth_sessions (sid, fid, user_id, user_agent, ip, created_at, last_used, expires_at)
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW(), $6)",
        )
        .bind(&new_sid)
        .bind(fid)
        .bind(&session.user_id)
        .bind(&session.user_agent)
        .bind(&session.ip)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Rotation::Rotated { new_sid })
    }

    /// Revoke every session in a family. Idempotent.
    pub async fn revoke_family(&self, fid: &str) -> Result<u64, AppError> {
        let revoked = sqlx::query(
            "UPDATE auth_sessions SET revoked_at = NOW()
             WHERE fid = $1 AND revoked_at IS NULL",
        )
        .bind(fid)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if revoked > 0 {
            tracing::info!(fid, revoked, "session family revoked");
        }
        Ok(revoked)
    }

    /// Revoke one session belonging to the given user. Idempotent.
    pub async fn revoke_session(&self, user_id: &str, sid: &str) -> Result<bool, AppError> {
        let revoked = sqlx::query(
            "UPDATE auth_sessions SET revoked_at = NOW()
             WHERE sid = $1 AND user_id = $2 AND revoked_at IS NULL",
        )
        .bind(sid)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(revoked > 0)
    }

    /// Revoke all of a user's sessions, optionally sparing one (the
    /// caller's own).
    pub async fn revoke_all_sessions(
        &self,
        user_id: &str,
        except_sid: Option<&str>,
    ) -> Result<u64, AppError> {
        let revoked = match except_sid {
            Some(keep) => {
                sqlx::query(
                    "UPDATE auth_sessions SET revoked_at = NOW()
                     WHERE user_id = $1 AND sid <> $2 AND revoked_at IS NULL",
                )
                .bind(user_id)
                .bind(keep)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            None => {
                sqlx::query(
                    "UPDATE auth_sessions SET revoked_at = NOW()
                     WHERE user_id = $1 AND revoked_at IS NULL",
                )
                .bind(user_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };
        Ok(revoked)
    }

    /// Active (non-revoked, non-expired) sessions, most recently used
    /// first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM auth_sessions
             WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > NOW()
             ORDER BY last_used DESC",
            Session::SELECT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    pub async fn get(&self, sid: &str) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM auth_sessions WHERE sid = $1",
            Session::SELECT_COLUMNS
        ))
        .bind(sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Drop rows that expired more than 30 days ago; the token lifecycle
    /// ends long before its row does.
    pub async fn cleanup_expired(&self) -> Result<u64, AppError> {
        let removed = sqlx::query(
            "DELETE FROM auth_sessions WHERE expires_at < NOW() - INTERVAL '30 days'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_128_bit_hex() {
        let sid = new_session_id();
        let fid = new_family_id();
        assert_eq!(sid.len(), 32);
        assert_eq!(fid.len(), 32);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sid, fid);
        assert_ne!(new_session_id(), new_session_id());
    }
}
