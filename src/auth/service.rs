//! Authentication Service
//!
//! The full account lifecycle: registration, credential authentication
//! with lockout, token issuance bound to session families, refresh with
//! reuse detection, blacklisting, password reset and change, email
//! verification, step-up challenges, guest accounts, and role grants.
//! Sessions persist through the session store; the blacklist and step-up
//! challenges live in their own Redis namespaces.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::config::{AuthSettings, JwtSettings};
use crate::cache::RedisClient;
use crate::errors::AppError;
use crate::models::{RoleGrant, User, UserRole};
use crate::services::Mailer;

use super::audit::AuditLog;
use super::password;
use super::roles;
use super::sessions::{new_family_id, new_session_id, Rotation, SessionStore};
use super::tokens::{Claims, TokenKind, TokenManager};

/// Refresh lifetime when the client did not ask to be remembered.
const SHORT_REFRESH_TTL_SECS: i64 = 8 * 3600;

/// Step-up challenges expire after five minutes.
const STEP_UP_TTL_SECS: u64 = 300;

const BLACKLIST_PREFIX: &str = "token_blacklist:";
const STEP_UP_PREFIX: &str = "step_up:";

/// A fully-resolved authenticated principal.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
    pub roles: Vec<RoleGrant>,
    pub permissions: Vec<String>,
}

/// The token pair issued at login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepUpMethod {
    Password,
    Webauthn,
    FreshSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpChallenge {
    pub challenge_id: String,
    pub user_id: String,
    pub required_method: StepUpMethod,
    pub return_to: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn new_user_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// URL-safe single-use token (verification, password reset).
fn new_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct AuthService {
    pool: PgPool,
    sessions: SessionStore,
    tokens: TokenManager,
    audit: AuditLog,
    blacklist: Option<RedisClient>,
    challenges: Option<RedisClient>,
    mailer: Option<Arc<Mailer>>,
    auth_settings: AuthSettings,
    jwt_settings: JwtSettings,
    bcrypt_rounds: u32,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        redis: Option<&RedisClient>,
        mailer: Option<Arc<Mailer>>,
        auth_settings: AuthSettings,
        jwt_settings: JwtSettings,
        bcrypt_rounds: u32,
    ) -> Self {
        Self {
            sessions: SessionStore::new(pool.clone()),
            tokens: TokenManager::new(jwt_settings.clone()),
            audit: AuditLog::new(pool.clone()),
            blacklist: redis.map(|r| r.with_prefix(BLACKLIST_PREFIX)),
            challenges: redis.map(|r| r.with_prefix(STEP_UP_PREFIX)),
            pool,
            mailer,
            auth_settings,
            jwt_settings,
            bcrypt_rounds,
        }
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<(AuthenticatedUser, TokenBundle), AppError> {
        let email = normalize_email(email)?;

        let strength = password::validate_password_strength(password);
        if !strength.is_valid {
            return Err(AppError::PasswordPolicy {
                issues: strength.issues,
            });
        }
        let password_hash = password::hash_password(password, self.bcrypt_rounds)?;

        let user_id = new_user_id();
        let verification_token = new_opaque_token();
        let verification_expires = Utc::now() + Duration::hours(24);

        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query("SELECT id FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(AppError::Conflict(
                "Email address is already registered".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO users
                 (id, email, password_hash, name, email_verified,
                  verification_token, verification_expires, created_at, updated_at)
             VALUES ($1, $2, $3, $4, FALSE, $5, $6, NOW(), NOW())",
        )
        .bind(&user_id)
        .bind(&email)
        .bind(&password_hash)
        .bind(name)
        .bind(&verification_token)
        .bind(verification_expires)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO user_roles (user_id, role, level, granted_at, granted_by, is_active)
             VALUES ($1, $2, $3, NOW(), $1, TRUE)",
        )
        .bind(&user_id)
        .bind(roles::ROLE_USER)
        .bind(roles::role_level(roles::ROLE_USER))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(mailer) = &self.mailer {
            mailer
                .send_verification_email(&email, &verification_token, name.unwrap_or("there"))
                .await;
        }

        self.audit
            .log(
                Some(&user_id),
                "user_registered",
                ip,
                true,
                json!({ "email": email }),
            )
            .await;
        tracing::info!(user_id = %user_id, "user registered");

        let user = AuthenticatedUser {
            user_id,
            email,
            name: name.map(str::to_string),
            email_verified: false,
            roles: vec![RoleGrant::new(roles::ROLE_USER, 1)],
            permissions: roles::resolve_permissions(&[RoleGrant::new(roles::ROLE_USER, 1)]),
        };
        let tokens = self.generate_tokens(&user, false, user_agent, ip).await?;
        Ok((user, tokens))
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Credential check with lockout. Returns None for every failure mode
    /// (unknown email, wrong password, locked account); callers surface a
    /// single opaque message.
    pub async fn authenticate_user(
        &self,
        email: &str,
        password_attempt: &str,
        ip: Option<&str>,
    ) -> Result<Option<AuthenticatedUser>, AppError> {
        let email = match normalize_email(email) {
            Ok(email) => email,
            Err(_) => return Ok(None),
        };

        // Single role-joined lookup; active, unexpired grants only.
        let row = sqlx::query(
            "SELECT u.id, u.name, u.email, u.password_hash, u.email_verified,
                    u.failed_login_attempts, u.locked_until,
                    COALESCE(
                        JSON_AGG(
                            JSON_BUILD_OBJECT('role', ur.role, 'level', ur.level)
                        ) FILTER (WHERE ur.is_active = TRUE
                                  AND (ur.expires_at IS NULL OR ur.expires_at > NOW())),
                        '[]'::json
                    ) AS roles
             FROM users u
             LEFT JOIN user_roles ur ON u.id = ur.user_id
             WHERE u.email = $1
             GROUP BY u.id, u.name, u.email, u.password_hash, u.email_verified,
                      u.failed_login_attempts, u.locked_until",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            self.audit
                .log(
                    None,
                    "login_failed",
                    ip,
                    false,
                    json!({ "email": email, "reason": "user_not_found" }),
                )
                .await;
            return Ok(None);
        };

        let user_id: String = row.get("id");
        let locked_until: Option<DateTime<Utc>> = row.get("locked_until");
        if locked_until.map(|until| until > Utc::now()).unwrap_or(false) {
            self.audit
                .log(
                    Some(&user_id),
                    "login_failed",
                    ip,
                    false,
                    json!({ "reason": "account_locked" }),
                )
                .await;
            return Ok(None);
        }

        let password_hash: Option<String> = row.get("password_hash");
        let verified = password_hash
            .as_deref()
            .map(|hash| password::verify_password(password_attempt, hash))
            .unwrap_or(false);

        if !verified {
            let failed: i32 = row.get::<i32, _>("failed_login_attempts") + 1;
            let locked_until = if failed >= self.auth_settings.max_failed_attempts {
                Some(Utc::now() + Duration::minutes(self.auth_settings.lockout_minutes))
            } else {
                None
            };
            sqlx::query(
                "UPDATE users SET failed_login_attempts = $2, locked_until = $3 WHERE id = $1",
            )
            .bind(&user_id)
            .bind(failed)
            .bind(locked_until)
            .execute(&self.pool)
            .await?;

            if locked_until.is_some() {
                tracing::warn!(
                    target: "security",
                    user_id = %user_id,
                    failed_attempts = failed,
                    "account locked after repeated failures"
                );
            }
            self.audit
                .log(
                    Some(&user_id),
                    "login_failed",
                    ip,
                    false,
                    json!({ "reason": "invalid_password", "failed_attempts": failed }),
                )
                .await;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, last_login = NOW()
             WHERE id = $1",
        )
        .bind(&user_id)
        .execute(&self.pool)
        .await?;

        let role_grants = parse_role_grants(row.try_get::<Value, _>("roles").unwrap_or(Value::Null));
        let permissions = roles::resolve_permissions(&role_grants);

        self.audit
            .log(Some(&user_id), "login_success", ip, true, json!({ "email": email }))
            .await;
        tracing::info!(user_id = %user_id, "user authenticated");

        Ok(Some(AuthenticatedUser {
            user_id,
            email: row.get("email"),
            name: row.get("name"),
            email_verified: row.get("email_verified"),
            roles: role_grants,
            permissions,
        }))
    }

    // =========================================================================
    // Token issuance and refresh
    // =========================================================================

    /// Mint the access/refresh pair for a fresh login and persist the
    /// first session of a new family.
    pub async fn generate_tokens(
        &self,
        user: &AuthenticatedUser,
        remember_me: bool,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<TokenBundle, AppError> {
        let sid = new_session_id();
        let fid = new_family_id();
        let refresh_ttl = if remember_me {
            self.jwt_settings.refresh_ttl_secs()
        } else {
            SHORT_REFRESH_TTL_SECS
        };

        let (access_token, expires_in) = self.tokens.mint_access_token(
            &user.user_id,
            &user.email,
            &user.roles,
            &user.permissions,
            &sid,
            &fid,
        )?;
        let (refresh_token, refresh_expires_in) =
            self.tokens
                .mint_refresh_token(&user.user_id, &sid, &fid, refresh_ttl)?;

        self.sessions
            .persist_initial(&sid, &fid, &user.user_id, user_agent, ip, refresh_ttl)
            .await?;

        Ok(TokenBundle {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_expires_in,
        })
    }

    /// Refresh flow with reuse detection: verify, rotate the session, and
    /// mint a new pair bound to the successor session in the same family.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
        ip: Option<&str>,
    ) -> Result<TokenBundle, AppError> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh)?;

        if self.is_jti_blacklisted(&claims.jti).await {
            return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
        }

        // The successor inherits the remaining horizon; rotation never
        // extends a family's lifetime.
        let remaining_ttl = claims.remaining_ttl_secs() as i64;
        let rotation = self
            .sessions
            .rotate_or_reject(&claims.sid, &claims.fid, remaining_ttl)
            .await?;

        let new_sid = match rotation {
            Rotation::Rotated { new_sid } => new_sid,
            Rotation::ReuseDetected => {
                self.audit
                    .log(
                        Some(&claims.uid),
                        "refresh_reuse_detected",
                        ip,
                        false,
                        json!({ "fid": claims.fid, "sid": claims.sid }),
                    )
                    .await;
                return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
            }
        };

        let user = self
            .get_user_profile(&claims.uid)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".to_string()))?;

        let (access_token, expires_in) = self.tokens.mint_access_token(
            &user.user_id,
            &user.email,
            &user.roles,
            &user.permissions,
            &new_sid,
            &claims.fid,
        )?;
        let (new_refresh, refresh_expires_in) =
            self.tokens
                .mint_refresh_token(&user.user_id, &new_sid, &claims.fid, remaining_ttl)?;

        self.audit
            .log(
                Some(&user.user_id),
                "token_refreshed",
                ip,
                true,
                json!({ "fid": claims.fid }),
            )
            .await;

        Ok(TokenBundle {
            access_token,
            refresh_token: new_refresh,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_expires_in,
        })
    }

    /// Verify an access token for request authentication: signature,
    /// claims, and the blacklist.
    pub async fn verify_access(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.tokens.verify(token, TokenKind::Access)?;
        if self.is_jti_blacklisted(&claims.jti).await {
            tracing::warn!(target: "security", "attempted use of revoked token");
            return Err(AppError::Unauthorized("Token has been revoked".to_string()));
        }
        Ok(claims)
    }

    // =========================================================================
    // Blacklist
    // =========================================================================

    /// Revoke a token until its natural expiry. Refresh tokens also take
    /// their whole session family down.
    pub async fn invalidate_token(&self, token: &str, ip: Option<&str>) -> bool {
        let Some(claims) = self.tokens.decode_unverified(token) else {
            return false;
        };
        let ttl = claims.remaining_ttl_secs();
        if ttl == 0 {
            return true;
        }

        let stored = match &self.blacklist {
            Some(blacklist) => {
                blacklist
                    .set_json(&claims.jti, &json!({ "revoked": true }), Some(ttl))
                    .await
            }
            None => {
                tracing::warn!("token blacklist unavailable: no redis configured");
                false
            }
        };

        if claims.token_type == TokenKind::Refresh {
            if let Err(e) = self.sessions.revoke_family(&claims.fid).await {
                tracing::error!(error = %e, fid = %claims.fid, "family revocation failed");
            }
        }

        self.audit
            .log(
                Some(&claims.uid),
                "token_invalidated",
                ip,
                stored,
                json!({ "jti": claims.jti, "type": claims.token_type }),
            )
            .await;
        stored
    }

    pub async fn is_token_blacklisted(&self, token: &str) -> bool {
        match self.tokens.decode_unverified(token) {
            Some(claims) => self.is_jti_blacklisted(&claims.jti).await,
            None => false,
        }
    }

    async fn is_jti_blacklisted(&self, jti: &str) -> bool {
        match &self.blacklist {
            Some(blacklist) => blacklist.exists(jti).await,
            None => false,
        }
    }

    // =========================================================================
    // Password management
    // =========================================================================

    /// Full user row by id.
    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            User::SELECT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        current: &str,
        new_password: &str,
        ip: Option<&str>,
    ) -> Result<(), AppError> {
        let user = self
            .find_user(user_id)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        let verified = user
            .password_hash
            .as_deref()
            .map(|h| password::verify_password(current, h))
            .unwrap_or(false);
        if !verified {
            self.audit
                .log(
                    Some(user_id),
                    "password_change_failed",
                    ip,
                    false,
                    json!({ "reason": "invalid_current_password" }),
                )
                .await;
            return Err(AppError::InvalidCredentials);
        }

        let strength = password::validate_password_strength(new_password);
        if !strength.is_valid {
            return Err(AppError::PasswordPolicy {
                issues: strength.issues,
            });
        }

        let new_hash = password::hash_password(new_password, self.bcrypt_rounds)?;
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(&new_hash)
            .execute(&self.pool)
            .await?;

        self.audit
            .log(Some(user_id), "password_changed", ip, true, json!({}))
            .await;
        Ok(())
    }

    /// Always reports success so the endpoint cannot be used for account
    /// enumeration.
    pub async fn initiate_password_reset(&self, email: &str, ip: Option<&str>) -> bool {
        let Ok(email) = normalize_email(email) else {
            return true;
        };

        let row = match sqlx::query(
            "SELECT id, name FROM users WHERE email = $1 AND email NOT LIKE '%@guest.local'",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(error = %e, "password reset lookup failed");
                return true;
            }
        };

        let Some(row) = row else {
            self.audit
                .log(
                    None,
                    "password_reset_requested",
                    ip,
                    false,
                    json!({ "email": email, "reason": "user_not_found" }),
                )
                .await;
            return true;
        };

        let user_id: String = row.get("id");
        let name: Option<String> = row.get("name");
        let reset_token = new_opaque_token();
        let reset_expires = Utc::now() + Duration::hours(1);

        if let Err(e) = sqlx::query(
            "UPDATE users SET reset_token = $2, reset_expires = $3 WHERE id = $1",
        )
        .bind(&user_id)
        .bind(&reset_token)
        .bind(reset_expires)
        .execute(&self.pool)
        .await
        {
            tracing::error!(error = %e, "failed to store reset token");
            return true;
        }

        if let Some(mailer) = &self.mailer {
            mailer
                .send_password_reset_email(&email, &reset_token, name.as_deref().unwrap_or("there"))
                .await;
        }

        self.audit
            .log(
                Some(&user_id),
                "password_reset_requested",
                ip,
                true,
                json!({ "email": email }),
            )
            .await;
        true
    }

    pub async fn reset_password_with_token(
        &self,
        reset_token: &str,
        new_password: &str,
        ip: Option<&str>,
    ) -> Result<bool, AppError> {
        let strength = password::validate_password_strength(new_password);
        if !strength.is_valid {
            return Err(AppError::PasswordPolicy {
                issues: strength.issues,
            });
        }

        let row = sqlx::query(
            "SELECT id, email FROM users
             WHERE reset_token = $1 AND reset_expires > NOW()
               AND email NOT LIKE '%@guest.local'",
        )
        .bind(reset_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            self.audit
                .log(
                    None,
                    "password_reset_failed",
                    ip,
                    false,
                    json!({ "reason": "invalid_token" }),
                )
                .await;
            return Ok(false);
        };

        let user_id: String = row.get("id");
        let new_hash = password::hash_password(new_password, self.bcrypt_rounds)?;

        // Resetting also clears any lockout state.
        sqlx::query(
            "UPDATE users SET
                 password_hash = $2,
                 reset_token = NULL,
                 reset_expires = NULL,
                 failed_login_attempts = 0,
                 locked_until = NULL,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(&user_id)
        .bind(&new_hash)
        .execute(&self.pool)
        .await?;

        self.audit
            .log(
                Some(&user_id),
                "password_reset_completed",
                ip,
                true,
                json!({ "email": row.get::<String, _>("email") }),
            )
            .await;
        Ok(true)
    }

    // =========================================================================
    // Email verification
    // =========================================================================

    pub async fn verify_email(&self, verification_token: &str) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT id, email, name FROM users
             WHERE verification_token = $1 AND verification_expires > NOW()
               AND email_verified = FALSE",
        )
        .bind(verification_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let user_id: String = row.get("id");

        sqlx::query(
            "UPDATE users SET
                 email_verified = TRUE,
                 verification_token = NULL,
                 verification_expires = NULL,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(&user_id)
        .execute(&self.pool)
        .await?;

        if let Some(mailer) = &self.mailer {
            let email: String = row.get("email");
            let name: Option<String> = row.get("name");
            mailer
                .send_welcome_email(&email, name.as_deref().unwrap_or("there"))
                .await;
        }

        self.audit
            .log(Some(&user_id), "email_verified", None, true, json!({}))
            .await;
        Ok(true)
    }

    // =========================================================================
    // Step-up challenges
    // =========================================================================

    pub async fn create_step_up_challenge(
        &self,
        user_id: &str,
        method: StepUpMethod,
        return_to: &str,
    ) -> Result<StepUpChallenge, AppError> {
        if method == StepUpMethod::Webauthn
            && !(self.auth_settings.webauthn_enabled || self.auth_settings.webauthn_mock)
        {
            return Err(AppError::ValidationMessage(
                "WebAuthn is not enabled".to_string(),
            ));
        }
        let challenges = self.challenges.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("step-up challenges unavailable".to_string())
        })?;

        let now = Utc::now();
        let challenge = StepUpChallenge {
            challenge_id: new_opaque_token(),
            user_id: user_id.to_string(),
            required_method: method,
            return_to: return_to.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(STEP_UP_TTL_SECS as i64),
            completed: false,
            completed_at: None,
        };

        let value = serde_json::to_value(&challenge)
            .map_err(|e| AppError::Internal(format!("challenge serialization: {e}")))?;
        if !challenges
            .set_json(&challenge.challenge_id, &value, Some(STEP_UP_TTL_SECS))
            .await
        {
            return Err(AppError::ServiceUnavailable(
                "failed to store step-up challenge".to_string(),
            ));
        }

        tracing::info!(
            user_id,
            method = ?challenge.required_method,
            "step-up challenge created"
        );
        Ok(challenge)
    }

    pub async fn get_step_up_challenge(&self, challenge_id: &str) -> Option<StepUpChallenge> {
        let challenges = self.challenges.as_ref()?;
        let value = challenges.get_json(challenge_id).await?;
        let challenge: StepUpChallenge = serde_json::from_value(value).ok()?;
        if challenge.expires_at <= Utc::now() {
            return None;
        }
        Some(challenge)
    }

    /// Satisfy a password-method challenge by re-verifying the user's
    /// current password.
    pub async fn verify_step_up_password(
        &self,
        challenge_id: &str,
        user_id: &str,
        password_attempt: &str,
        ip: Option<&str>,
    ) -> Result<bool, AppError> {
        let Some(challenge) = self.get_step_up_challenge(challenge_id).await else {
            return Ok(false);
        };
        if challenge.user_id != user_id
            || challenge.required_method != StepUpMethod::Password
            || challenge.completed
        {
            return Ok(false);
        }

        let user = self
            .find_user(user_id)
            .await?
            .ok_or(AppError::InvalidCredentials)?;
        let verified = user
            .password_hash
            .as_deref()
            .map(|hash| password::verify_password(password_attempt, hash))
            .unwrap_or(false);
        if !verified {
            self.audit
                .log(
                    Some(user_id),
                    "step_up_failed",
                    ip,
                    false,
                    json!({ "challenge_id": challenge_id, "method": "password" }),
                )
                .await;
            return Ok(false);
        }

        let completed = self.complete_step_up_challenge(challenge_id).await;
        self.audit
            .log(
                Some(user_id),
                "step_up_completed",
                ip,
                completed,
                json!({ "challenge_id": challenge_id, "method": "password" }),
            )
            .await;
        Ok(completed)
    }

    /// Satisfy a challenge whose method carries its own proof: a mocked
    /// WebAuthn assertion (test deployments only) or a fresh session.
    /// Password challenges always go through password verification.
    pub async fn complete_step_up_without_password(
        &self,
        challenge_id: &str,
        user_id: &str,
        sid: &str,
    ) -> Result<bool, AppError> {
        let Some(challenge) = self.get_step_up_challenge(challenge_id).await else {
            return Ok(false);
        };
        if challenge.user_id != user_id || challenge.completed {
            return Ok(false);
        }

        match challenge.required_method {
            StepUpMethod::Password => {
                return Err(AppError::Forbidden(
                    "Password verification required".to_string(),
                ));
            }
            StepUpMethod::Webauthn => {
                if !self.auth_settings.webauthn_mock {
                    return Err(AppError::Forbidden(
                        "WebAuthn verification required".to_string(),
                    ));
                }
            }
            StepUpMethod::FreshSession => {
                let now = Utc::now();
                let fresh = self
                    .sessions
                    .get(sid)
                    .await?
                    .map(|s| {
                        s.is_usable(now)
                            && (now - s.created_at).num_seconds() <= STEP_UP_TTL_SECS as i64
                    })
                    .unwrap_or(false);
                if !fresh {
                    return Err(AppError::Forbidden("A fresh login is required".to_string()));
                }
            }
        }

        let completed = self.complete_step_up_challenge(challenge_id).await;
        self.audit
            .log(
                Some(user_id),
                "step_up_completed",
                None,
                completed,
                json!({ "challenge_id": challenge_id, "method": challenge.required_method }),
            )
            .await;
        Ok(completed)
    }

    pub async fn complete_step_up_challenge(&self, challenge_id: &str) -> bool {
        let Some(mut challenge) = self.get_step_up_challenge(challenge_id).await else {
            return false;
        };
        let Some(challenges) = self.challenges.as_ref() else {
            return false;
        };

        challenge.completed = true;
        challenge.completed_at = Some(Utc::now());
        let remaining = (challenge.expires_at - Utc::now()).num_seconds().max(1) as u64;
        match serde_json::to_value(&challenge) {
            Ok(value) => {
                challenges
                    .set_json(challenge_id, &value, Some(remaining))
                    .await
            }
            Err(_) => false,
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<crate::models::Session>, AppError> {
        self.sessions.list_sessions(user_id).await
    }

    pub async fn revoke_session(&self, user_id: &str, sid: &str) -> Result<bool, AppError> {
        let revoked = self.sessions.revoke_session(user_id, sid).await?;
        if revoked {
            self.audit
                .log(Some(user_id), "session_revoked", None, true, json!({ "sid": sid }))
                .await;
        }
        Ok(revoked)
    }

    pub async fn revoke_all_sessions(
        &self,
        user_id: &str,
        except_sid: Option<&str>,
    ) -> Result<u64, AppError> {
        let revoked = self.sessions.revoke_all_sessions(user_id, except_sid).await?;
        self.audit
            .log(
                Some(user_id),
                "all_sessions_revoked",
                None,
                true,
                json!({ "revoked": revoked }),
            )
            .await;
        Ok(revoked)
    }

    // =========================================================================
    // Profile
    // =========================================================================

    pub async fn get_user_profile(
        &self,
        user_id: &str,
    ) -> Result<Option<AuthenticatedUser>, AppError> {
        let row = sqlx::query(
            "SELECT u.id, u.name, u.email, u.email_verified,
                    COALESCE(
                        JSON_AGG(
                            JSON_BUILD_OBJECT('role', ur.role, 'level', ur.level)
                        ) FILTER (WHERE ur.is_active = TRUE
                                  AND (ur.expires_at IS NULL OR ur.expires_at > NOW())),
                        '[]'::json
                    ) AS roles
             FROM users u
             LEFT JOIN user_roles ur ON u.id = ur.user_id
             WHERE u.id = $1
             GROUP BY u.id, u.name, u.email, u.email_verified",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let role_grants =
                parse_role_grants(row.try_get::<Value, _>("roles").unwrap_or(Value::Null));
            let permissions = roles::resolve_permissions(&role_grants);
            AuthenticatedUser {
                user_id: row.get("id"),
                email: row.get("email"),
                name: row.get("name"),
                email_verified: row.get("email_verified"),
                roles: role_grants,
                permissions,
            }
        }))
    }

    pub async fn update_user_profile(
        &self,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<AuthenticatedUser, AppError> {
        sqlx::query(
            "UPDATE users SET name = COALESCE($2, name), updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        self.get_user_profile(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }

    // =========================================================================
    // Guest accounts
    // =========================================================================

    /// Minimal-privilege account without credentials; verified by
    /// construction because there is no mailbox to confirm.
    pub async fn create_guest_user(
        &self,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<(AuthenticatedUser, TokenBundle), AppError> {
        let user_id = new_user_id();
        let email = format!("guest-{user_id}@guest.local");

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (id, email, name, email_verified, created_at, updated_at)
             VALUES ($1, $2, 'Guest User', TRUE, NOW(), NOW())",
        )
        .bind(&user_id)
        .bind(&email)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO user_roles (user_id, role, level, granted_at, granted_by, is_active)
             VALUES ($1, $2, $3, NOW(), $1, TRUE)",
        )
        .bind(&user_id)
        .bind(roles::ROLE_GUEST)
        .bind(roles::role_level(roles::ROLE_GUEST))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.audit
            .log(Some(&user_id), "guest_created", ip, true, json!({}))
            .await;
        tracing::info!(user_id = %user_id, "guest user created");

        let grants = vec![RoleGrant::new(roles::ROLE_GUEST, 0)];
        let user = AuthenticatedUser {
            user_id,
            email,
            name: Some("Guest User".to_string()),
            email_verified: true,
            permissions: roles::resolve_permissions(&grants),
            roles: grants,
        };
        let tokens = self.generate_tokens(&user, false, user_agent, ip).await?;
        Ok((user, tokens))
    }

    /// Convert a guest into a full account. Requires the full email and
    /// password validation of registration and only ever grants `user`
    /// level 1; elevation stays a separate admin operation.
    pub async fn upgrade_guest_to_email(
        &self,
        user_id: &str,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<AuthenticatedUser, AppError> {
        let email = normalize_email(email)?;
        let strength = password::validate_password_strength(password);
        if !strength.is_valid {
            return Err(AppError::PasswordPolicy {
                issues: strength.issues,
            });
        }
        let password_hash = password::hash_password(password, self.bcrypt_rounds)?;
        let verification_token = new_opaque_token();
        let verification_expires = Utc::now() + Duration::hours(24);

        let current = self
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        if !current.is_guest() {
            return Err(AppError::ValidationMessage(
                "Only guest accounts can be upgraded".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query("SELECT id FROM users WHERE email = $1 AND id <> $2")
            .bind(&email)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(AppError::Conflict(
                "Email address is already registered".to_string(),
            ));
        }

        sqlx::query(
            "UPDATE users SET
                 email = $2,
                 name = COALESCE($3, name),
                 password_hash = $4,
                 email_verified = FALSE,
                 verification_token = $5,
                 verification_expires = $6,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(&email)
        .bind(name)
        .bind(&password_hash)
        .bind(&verification_token)
        .bind(verification_expires)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE user_roles SET is_active = FALSE
             WHERE user_id = $1 AND role = $2 AND is_active = TRUE",
        )
        .bind(user_id)
        .bind(roles::ROLE_GUEST)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO user_roles (user_id, role, level, granted_at, granted_by, is_active)
             VALUES ($1, $2, $3, NOW(), $1, TRUE)
             ON CONFLICT (user_id, role)
             DO UPDATE SET is_active = TRUE, level = EXCLUDED.level, granted_at = NOW()",
        )
        .bind(user_id)
        .bind(roles::ROLE_USER)
        .bind(roles::role_level(roles::ROLE_USER))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(mailer) = &self.mailer {
            mailer
                .send_verification_email(&email, &verification_token, name.unwrap_or("there"))
                .await;
        }
        self.audit
            .log(
                Some(user_id),
                "guest_upgraded",
                None,
                true,
                json!({ "email": email }),
            )
            .await;

        self.get_user_profile(user_id)
            .await?
            .ok_or_else(|| AppError::Internal("upgraded user vanished".to_string()))
    }

    // =========================================================================
    // Role administration
    // =========================================================================

    /// All role grant rows for a user, active first, highest level first.
    pub async fn get_user_roles(&self, user_id: &str) -> Result<Vec<UserRole>, AppError> {
        let grants = sqlx::query_as::<_, UserRole>(
            "SELECT id, user_id, role, level, granted_at, granted_by, expires_at, is_active
             FROM user_roles
             WHERE user_id = $1
             ORDER BY is_active DESC, level DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(grants)
    }

    pub async fn assign_role(
        &self,
        user_id: &str,
        role: &str,
        granted_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        if !roles::is_grantable_role(role) {
            return Err(AppError::ValidationMessage(format!(
                "'{role}' is not a grantable role"
            )));
        }
        sqlx::query(
            "INSERT INTO user_roles (user_id, role, level, granted_at, granted_by, expires_at, is_active)
             VALUES ($1, $2, $3, NOW(), $4, $5, TRUE)
             ON CONFLICT (user_id, role)
             DO UPDATE SET
                 level = EXCLUDED.level,
                 granted_by = EXCLUDED.granted_by,
                 granted_at = NOW(),
                 expires_at = EXCLUDED.expires_at,
                 is_active = TRUE",
        )
        .bind(user_id)
        .bind(role)
        .bind(roles::role_level(role))
        .bind(granted_by)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.audit
            .log(
                Some(user_id),
                "role_assigned",
                None,
                true,
                json!({ "role": role, "granted_by": granted_by }),
            )
            .await;
        tracing::info!(user_id, role, granted_by, "role assigned");
        Ok(())
    }

    pub async fn revoke_role(&self, user_id: &str, role: &str) -> Result<bool, AppError> {
        let changed = sqlx::query(
            "UPDATE user_roles SET is_active = FALSE WHERE user_id = $1 AND role = $2",
        )
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if changed > 0 {
            self.audit
                .log(
                    Some(user_id),
                    "role_revoked",
                    None,
                    true,
                    json!({ "role": role }),
                )
                .await;
        }
        Ok(changed > 0)
    }
}

fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(AppError::ValidationMessage(
            "Valid email address is required".to_string(),
        ));
    }
    Ok(email)
}

/// Parse the JSON_AGG role payload into grants, dropping malformed rows.
fn parse_role_grants(value: Value) -> Vec<RoleGrant> {
    value
        .as_array()
        .map(|grants| {
            grants
                .iter()
                .filter_map(|grant| {
                    Some(RoleGrant {
                        role: grant.get("role")?.as_str()?.to_string(),
                        level: grant.get("level")?.as_i64()? as i32,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  User@Example.COM ").unwrap(), "user@example.com");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("user@").is_err());
        assert!(normalize_email("").is_err());
    }

    #[test]
    fn role_grant_parsing_skips_malformed_entries() {
        let value = json!([
            { "role": "user", "level": 1 },
            { "role": "moderator" },
            { "level": 2 },
            { "role": "data_admin", "level": 2 }
        ]);
        let grants = parse_role_grants(value);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].role, "user");
        assert_eq!(grants[1].role, "data_admin");
        assert!(parse_role_grants(Value::Null).is_empty());
    }

    #[test]
    fn opaque_tokens_are_urlsafe_and_unique() {
        let token = new_opaque_token();
        assert_eq!(token.len(), 43); // 32 bytes, base64url without padding
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));
        assert_ne!(new_opaque_token(), new_opaque_token());
    }
}
