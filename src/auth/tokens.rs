//! Token Manager
//!
//! Mints and verifies the signed access/refresh token pair. Tokens are
//! HS256 with a KID header; claims carry the session (`sid`), family
//! (`fid`), and token id (`jti`) that the session store and blacklist key
//! on. Verification pins the algorithm, checks exp/nbf/iat with the
//! configured leeway, and validates issuer and audience.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::JwtSettings;
use crate::errors::AppError;
use crate::models::RoleGrant;

/// Audience claim carried by every locally-minted token.
pub const TOKEN_AUDIENCE: &str = "authenticated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenKind,
    pub sid: String,
    pub fid: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleGrant>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl Claims {
    /// Seconds until expiry; zero once past.
    pub fn remaining_ttl_secs(&self) -> u64 {
        (self.exp - Utc::now().timestamp()).max(0) as u64
    }
}

/// Random 128-bit token id.
pub fn new_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct TokenManager {
    settings: JwtSettings,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenManager {
    pub fn new(settings: JwtSettings) -> Self {
        let encoding = EncodingKey::from_secret(settings.secret.as_bytes());
        let decoding = DecodingKey::from_secret(settings.secret.as_bytes());
        Self {
            settings,
            encoding,
            decoding,
        }
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.settings.kid.clone());
        header
    }

    /// Mint an access token bound to a session. Returns the token and its
    /// TTL in seconds.
    pub fn mint_access_token(
        &self,
        uid: &str,
        email: &str,
        roles: &[RoleGrant],
        permissions: &[String],
        sid: &str,
        fid: &str,
    ) -> Result<(String, i64), AppError> {
        let ttl = self.settings.access_ttl_secs();
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.settings.issuer.clone(),
            aud: TOKEN_AUDIENCE.to_string(),
            uid: uid.to_string(),
            email: Some(email.to_string()),
            token_type: TokenKind::Access,
            sid: sid.to_string(),
            fid: fid.to_string(),
            jti: new_jti(),
            iat: now,
            nbf: now,
            exp: now + ttl,
            roles: Some(roles.to_vec()),
            permissions: Some(permissions.to_vec()),
        };
        let token = encode(&self.header(), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("JWT encoding error: {e}")))?;
        Ok((token, ttl))
    }

    /// Mint a refresh token. TTL is caller-chosen (remember-me policy).
    pub fn mint_refresh_token(
        &self,
        uid: &str,
        sid: &str,
        fid: &str,
        ttl_secs: i64,
    ) -> Result<(String, i64), AppError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.settings.issuer.clone(),
            aud: TOKEN_AUDIENCE.to_string(),
            uid: uid.to_string(),
            email: None,
            token_type: TokenKind::Refresh,
            sid: sid.to_string(),
            fid: fid.to_string(),
            jti: new_jti(),
            iat: now,
            nbf: now,
            exp: now + ttl_secs,
            roles: None,
            permissions: None,
        };
        let token = encode(&self.header(), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("JWT encoding error: {e}")))?;
        Ok((token, ttl_secs))
    }

    /// Verify signature and claims; rejects the wrong token type, any
    /// algorithm other than the configured one, and the anonymous role.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.settings.clock_skew_leeway_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&[TOKEN_AUDIENCE]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::TokenExpired,
                _ => AppError::InvalidToken,
            }
        })?;

        let claims = data.claims;
        if claims.token_type != expected {
            tracing::warn!(
                target: "security",
                expected = ?expected,
                got = ?claims.token_type,
                "token type mismatch"
            );
            return Err(AppError::InvalidToken);
        }
        if claims
            .roles
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|grant| grant.role == "anonymous")
        {
            return Err(AppError::InvalidToken);
        }
        Ok(claims)
    }

    /// Decode the payload without signature verification. Only used to
    /// extract `jti`/`exp`/`fid` when blacklisting a token the caller
    /// already holds; never trusted for authentication.
    pub fn decode_unverified(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings() -> JwtSettings {
        JwtSettings {
            secret: "test-secret-key-for-unit-tests".to_string(),
            access_expire_hours: 0.25,
            refresh_expire_days: 30,
            clock_skew_leeway_secs: 0,
            issuer: "kehilla-directory".to_string(),
            kid: "primary".to_string(),
            jwks_url: None,
        }
    }

    fn manager() -> TokenManager {
        TokenManager::new(settings())
    }

    #[test]
    fn access_token_round_trip() {
        let tm = manager();
        let roles = vec![RoleGrant::new("user", 1)];
        let permissions = vec!["profile:view".to_string()];
        let (token, ttl) = tm
            .mint_access_token("u1", "a@b.c", &roles, &permissions, "s1", "f1")
            .unwrap();
        assert_eq!(ttl, 900);

        let claims = tm.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(claims.uid, "u1");
        assert_eq!(claims.email.as_deref(), Some("a@b.c"));
        assert_eq!(claims.sid, "s1");
        assert_eq!(claims.fid, "f1");
        assert_eq!(claims.token_type, TokenKind::Access);
        assert_eq!(claims.roles.unwrap(), roles);
        assert_eq!(claims.jti.len(), 32);
    }

    #[test]
    fn refresh_token_carries_no_roles() {
        let tm = manager();
        let (token, ttl) = tm.mint_refresh_token("u1", "s1", "f1", 86_400).unwrap();
        assert_eq!(ttl, 86_400);
        let claims = tm.verify(&token, TokenKind::Refresh).unwrap();
        assert!(claims.roles.is_none());
        assert!(claims.email.is_none());
    }

    #[test]
    fn type_confusion_is_rejected() {
        let tm = manager();
        let (refresh, _) = tm.mint_refresh_token("u1", "s1", "f1", 86_400).unwrap();
        assert!(matches!(
            tm.verify(&refresh, TokenKind::Access),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mut cfg = settings();
        cfg.access_expire_hours = -1.0;
        let tm = TokenManager::new(cfg);
        let (token, _) = tm
            .mint_access_token("u1", "a@b.c", &[], &[], "s1", "f1")
            .unwrap();
        assert!(matches!(
            tm.verify(&token, TokenKind::Access),
            Err(AppError::TokenExpired)
        ));
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let tm = manager();
        let (token, _) = tm
            .mint_access_token("u1", "a@b.c", &[], &[], "s1", "f1")
            .unwrap();
        let other = TokenManager::new(JwtSettings {
            secret: "a-different-secret".to_string(),
            ..settings()
        });
        assert!(other.verify(&token, TokenKind::Access).is_err());
    }

    #[test]
    fn anonymous_role_is_rejected() {
        let tm = manager();
        let roles = vec![RoleGrant::new("anonymous", 0)];
        let (token, _) = tm
            .mint_access_token("u1", "a@b.c", &roles, &[], "s1", "f1")
            .unwrap();
        assert!(matches!(
            tm.verify(&token, TokenKind::Access),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn unverified_decode_exposes_jti_and_exp() {
        let tm = manager();
        let (token, _) = tm.mint_refresh_token("u1", "s1", "f1", 60).unwrap();
        let claims = tm.decode_unverified(&token).unwrap();
        assert_eq!(claims.sid, "s1");
        assert!(claims.remaining_ttl_secs() <= 60);
    }

    #[test]
    fn jtis_are_unique() {
        assert_ne!(new_jti(), new_jti());
    }
}
