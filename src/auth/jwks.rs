//! JWKS Registry
//!
//! Verifier-side key management for RS256 tokens minted by an external
//! identity provider. Keys resolve by KID from a remote JWKS document,
//! cached per key with a TTL; unknown KIDs get exponential backoff so a
//! storm of bad tokens cannot hammer the endpoint. Verification pins
//! RS256, validates expiry and audience, and rejects anonymous tokens.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::tokens::TOKEN_AUDIENCE;

/// Cached key lifetime.
const KEY_CACHE_TTL_SECS: i64 = 86_400;

/// Ceiling on the unknown-kid backoff.
const MAX_BACKOFF_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone)]
struct CachedKey {
    jwk: Jwk,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Backoff {
    failures: u32,
    last_attempt: Option<DateTime<Utc>>,
}

impl Backoff {
    fn blocked(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            Some(at) if self.failures > 0 => {
                let wait = (1u64 << self.failures.min(8)).min(MAX_BACKOFF_SECS);
                now < at + chrono::Duration::seconds(wait as i64)
            }
            _ => false,
        }
    }
}

pub struct JwksRegistry {
    url: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, CachedKey>>,
    backoff: RwLock<HashMap<String, Backoff>>,
    /// Serializes remote fetches so concurrent misses on the same kid
    /// produce one request.
    fetch_lock: Mutex<()>,
}

impl JwksRegistry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            keys: RwLock::new(HashMap::new()),
            backoff: RwLock::new(HashMap::new()),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Resolve a key by KID: cache first, then one remote fetch guarded by
    /// the singleflight lock. Misses are recorded for backoff.
    pub async fn get_key(&self, kid: &str) -> Option<Jwk> {
        let now = Utc::now();
        {
            let keys = self.keys.read().await;
            if let Some(cached) = keys.get(kid) {
                if (now - cached.fetched_at).num_seconds() < KEY_CACHE_TTL_SECS {
                    return Some(cached.jwk.clone());
                }
            }
        }
        if self.backoff.read().await.get(kid).copied().unwrap_or_default().blocked(now) {
            tracing::debug!(kid, "jwks kid in backoff, not fetching");
            return None;
        }

        let _guard = self.fetch_lock.lock().await;
        // Another task may have fetched while this one waited.
        {
            let keys = self.keys.read().await;
            if let Some(cached) = keys.get(kid) {
                if (Utc::now() - cached.fetched_at).num_seconds() < KEY_CACHE_TTL_SECS {
                    return Some(cached.jwk.clone());
                }
            }
        }

        match self.fetch_document().await {
            Ok(document) => {
                let mut keys = self.keys.write().await;
                for jwk in document.keys {
                    keys.insert(
                        jwk.kid.clone(),
                        CachedKey {
                            jwk,
                            fetched_at: Utc::now(),
                        },
                    );
                }
                match keys.get(kid) {
                    Some(cached) => {
                        self.backoff.write().await.remove(kid);
                        Some(cached.jwk.clone())
                    }
                    None => {
                        self.note_failure(kid).await;
                        tracing::warn!(kid, "jwks document does not contain requested kid");
                        None
                    }
                }
            }
            Err(e) => {
                self.note_failure(kid).await;
                tracing::warn!(kid, error = %e, "jwks fetch failed");
                None
            }
        }
    }

    async fn note_failure(&self, kid: &str) {
        let mut backoff = self.backoff.write().await;
        let entry = backoff.entry(kid.to_string()).or_default();
        entry.failures += 1;
        entry.last_attempt = Some(Utc::now());
    }

    async fn fetch_document(&self) -> Result<JwksDocument, reqwest::Error> {
        self.http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwksDocument>()
            .await
    }

    /// Verify an RS256 token against the key set. Returns the payload, or
    /// None for any verification failure (never an error to the caller).
    pub async fn verify(&self, token: &str, expected_issuer: Option<&str>) -> Option<Value> {
        let header = decode_header(token).ok()?;
        if header.alg != Algorithm::RS256 {
            tracing::warn!(target: "security", alg = ?header.alg, "rejecting non-RS256 remote token");
            return None;
        }
        let kid = header.kid?;
        let jwk = self.get_key(&kid).await?;

        let decoding = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).ok()?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        if let Some(iss) = expected_issuer {
            validation.set_issuer(&[iss]);
        }

        let payload = match decode::<Value>(token, &decoding, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!(error = %e, "remote token verification failed");
                return None;
            }
        };

        // Anonymous principals are never accepted as authenticated users.
        let role = payload.get("role").and_then(Value::as_str).unwrap_or("");
        if role == "anon" || role == "anonymous" {
            tracing::warn!(target: "security", "rejecting anonymous remote token");
            return None;
        }
        Some(payload)
    }

    /// The key set as currently known; served by the JWKS endpoint.
    pub async fn document(&self) -> Value {
        let keys = self.keys.read().await;
        let entries: Vec<Value> = keys
            .values()
            .map(|cached| {
                serde_json::json!({
                    "kid": cached.jwk.kid,
                    "kty": cached.jwk.kty,
                    "alg": cached.jwk.alg.clone().unwrap_or_else(|| "RS256".to_string()),
                    "n": cached.jwk.n,
                    "e": cached.jwk.e,
                    "use": "sig",
                })
            })
            .collect();
        serde_json::json!({ "keys": entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_blocks() {
        let now = Utc::now();
        let fresh = Backoff::default();
        assert!(!fresh.blocked(now));

        let failed = Backoff {
            failures: 3,
            last_attempt: Some(now),
        };
        assert!(failed.blocked(now));
        // An 8-second wait has passed for 3 failures (2^3).
        assert!(!failed.blocked(now + chrono::Duration::seconds(9)));
    }

    #[test]
    fn backoff_is_capped() {
        let now = Utc::now();
        let saturated = Backoff {
            failures: 30,
            last_attempt: Some(now),
        };
        assert!(saturated.blocked(now + chrono::Duration::seconds(299)));
        assert!(!saturated.blocked(now + chrono::Duration::seconds(301)));
    }
}
