//! Role Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One role grant row from `user_roles`. A user holds at most one row per
/// role name; deactivation is a soft flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRole {
    pub id: i32,
    pub user_id: String,
    pub role: String,
    pub level: i32,
    pub granted_at: DateTime<Utc>,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl UserRole {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// The role/level pair as it travels inside tokens and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub role: String,
    pub level: i32,
}

impl RoleGrant {
    pub fn new(role: impl Into<String>, level: i32) -> Self {
        Self {
            role: role.into(),
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(is_active: bool, expires_in: Option<i64>) -> UserRole {
        let now = Utc::now();
        UserRole {
            id: 1,
            user_id: "u".into(),
            role: "moderator".into(),
            level: 1,
            granted_at: now,
            granted_by: None,
            expires_at: expires_in.map(|secs| now + Duration::seconds(secs)),
            is_active,
        }
    }

    #[test]
    fn effectiveness_requires_active_and_unexpired() {
        let now = Utc::now();
        assert!(grant(true, None).is_effective(now));
        assert!(grant(true, Some(60)).is_effective(now));
        assert!(!grant(true, Some(-60)).is_effective(now));
        assert!(!grant(false, None).is_effective(now));
    }
}
