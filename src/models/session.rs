//! Session Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One refresh-token session row. `fid` groups the rotation lineage that
/// descends from a single login.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub sid: String,
    pub fid: String,
    pub user_id: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub const SELECT_COLUMNS: &'static str =
        "sid, fid, user_id, user_agent, ip, created_at, last_used, expires_at, revoked_at";

    /// A session is usable iff it is not revoked and not expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(revoked: bool, expires_in: i64) -> Session {
        let now = Utc::now();
        Session {
            sid: "s".into(),
            fid: "f".into(),
            user_id: "u".into(),
            user_agent: None,
            ip: None,
            created_at: now,
            last_used: now,
            expires_at: now + Duration::seconds(expires_in),
            revoked_at: if revoked { Some(now) } else { None },
        }
    }

    #[test]
    fn usable_requires_unrevoked_and_unexpired() {
        let now = Utc::now();
        assert!(session(false, 60).is_usable(now));
        assert!(!session(true, 60).is_usable(now));
        assert!(!session(false, -60).is_usable(now));
    }
}
