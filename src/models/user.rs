//! User Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User record matching the `users` schema. Guest accounts carry the
/// `guest-<id>@guest.local` email pattern and no password hash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    #[serde(skip_serializing)]
    pub verification_expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub reset_expires: Option<DateTime<Utc>>,
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// SQL columns to select for a full user record.
    pub const SELECT_COLUMNS: &'static str = "id, email, password_hash, name, email_verified, \
         verification_token, verification_expires, reset_token, reset_expires, \
         failed_login_attempts, locked_until, last_login, created_at, updated_at";

    pub fn is_guest(&self) -> bool {
        self.email.ends_with("@guest.local")
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_user(email: &str, locked_until: Option<DateTime<Utc>>) -> User {
        let now = Utc::now();
        User {
            id: "u1".into(),
            email: email.into(),
            password_hash: None,
            name: None,
            email_verified: true,
            verification_token: None,
            verification_expires: None,
            reset_token: None,
            reset_expires: None,
            failed_login_attempts: 0,
            locked_until,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn guest_detection_uses_email_pattern() {
        assert!(blank_user("guest-abc123@guest.local", None).is_guest());
        assert!(!blank_user("someone@example.com", None).is_guest());
    }

    #[test]
    fn lock_expires_with_time() {
        let now = Utc::now();
        let locked = blank_user("a@b.c", Some(now + chrono::Duration::minutes(5)));
        let unlocked = blank_user("a@b.c", Some(now - chrono::Duration::minutes(5)));
        assert!(locked.is_locked(now));
        assert!(!unlocked.is_locked(now));
    }
}
