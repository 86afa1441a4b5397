//! Rate Limiting Middleware
//!
//! Per-IP throttling of the credential endpoints. Every observation goes
//! through one bookkeeping path: ordinary attempts weigh one, failed
//! logins weigh two, and spending the whole budget locks the address out
//! for a window. State is in-process; an unknown address always passes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;

use crate::{errors::AppError, AppState};

/// Budget applied to login and registration attempts.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_hits: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_hits: 5,
            window: Duration::from_secs(300),
            lockout: Duration::from_secs(900),
        }
    }
}

const ATTEMPT_WEIGHT: u32 = 1;
/// Failed logins burn the budget twice as fast.
const FAILURE_WEIGHT: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct IpRecord {
    hits: u32,
    window_started: Instant,
    locked_until: Option<Instant>,
}

impl IpRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            hits: 0,
            window_started: now,
            locked_until: None,
        }
    }

    fn lock_lapsed(&self, now: Instant) -> bool {
        self.locked_until.map(|until| now >= until).unwrap_or(false)
    }

    fn window_lapsed(&self, policy: &RateLimitPolicy, now: Instant) -> bool {
        now.duration_since(self.window_started) > policy.window
    }

    /// Seconds the caller must wait, or None when the address may
    /// proceed.
    fn retry_after_secs(&self, policy: &RateLimitPolicy, now: Instant) -> Option<u64> {
        if let Some(until) = self.locked_until {
            if now < until {
                return Some((until - now).as_secs().max(1));
            }
        }
        if self.window_lapsed(policy, now) {
            return None;
        }
        if self.hits >= policy.max_hits {
            let remaining = policy
                .window
                .saturating_sub(now.duration_since(self.window_started));
            return Some(remaining.as_secs().max(1));
        }
        None
    }
}

/// In-process limiter for the credential endpoints.
pub struct LoginRateLimiter {
    policy: RateLimitPolicy,
    records: RwLock<HashMap<String, IpRecord>>,
}

impl LoginRateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// The single bookkeeping path for every observation: roll a lapsed
    /// window (or lockout) forward, add the weight, and lock the address
    /// once the budget is spent.
    async fn note(&self, ip: &str, weight: u32) {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let record = records
            .entry(ip.to_string())
            .or_insert_with(|| IpRecord::fresh(now));

        if record.lock_lapsed(now) || record.window_lapsed(&self.policy, now) {
            *record = IpRecord::fresh(now);
        }

        record.hits += weight;
        if record.hits >= self.policy.max_hits && record.locked_until.is_none() {
            record.locked_until = Some(now + self.policy.lockout);
            tracing::warn!(
                target: "security",
                ip,
                hits = record.hits,
                "address locked out of credential endpoints"
            );
        }
    }

    /// Gate an incoming attempt: report how long to wait when the address
    /// is over budget, otherwise count the attempt and let it through.
    pub async fn acquire(&self, ip: &str) -> Option<u64> {
        let now = Instant::now();
        let blocked = self
            .records
            .read()
            .await
            .get(ip)
            .and_then(|record| record.retry_after_secs(&self.policy, now));
        if blocked.is_some() {
            return blocked;
        }
        self.note(ip, ATTEMPT_WEIGHT).await;
        None
    }

    /// Count a failed login against the address.
    pub async fn record_failure(&self, ip: &str) {
        self.note(ip, FAILURE_WEIGHT).await;
    }

    /// A successful login forgives the address entirely.
    pub async fn clear(&self, ip: &str) {
        self.records.write().await.remove(ip);
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

/// Middleware guarding the credential endpoints.
pub async fn rate_limit_login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = addr.ip().to_string();
    if let Some(retry_after_secs) = state.rate_limiter.acquire(&ip).await {
        tracing::warn!(
            target: "security",
            ip = %ip,
            retry_after = retry_after_secs,
            "rate limit exceeded for credential attempt"
        );
        return AppError::RateLimited { retry_after_secs }.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_hits: u32) -> LoginRateLimiter {
        LoginRateLimiter::new(RateLimitPolicy {
            max_hits,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn unknown_address_passes() {
        let limiter = limiter(5);
        assert_eq!(limiter.acquire("10.0.0.1").await, None);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_with_retry_hint() {
        let limiter = limiter(2);
        assert!(limiter.acquire("10.0.0.1").await.is_none());
        // The second attempt passes but spends the budget.
        assert!(limiter.acquire("10.0.0.1").await.is_none());
        let retry = limiter.acquire("10.0.0.1").await;
        assert!(retry.is_some());
        assert!(retry.unwrap() >= 1);
        // Other addresses are unaffected.
        assert!(limiter.acquire("10.0.0.2").await.is_none());
    }

    #[tokio::test]
    async fn failures_count_double() {
        let limiter = limiter(3);
        assert!(limiter.acquire("10.0.0.1").await.is_none());
        limiter.record_failure("10.0.0.1").await;
        // 1 + 2 = 3 hits: the budget is spent.
        assert!(limiter.acquire("10.0.0.1").await.is_some());
    }

    #[tokio::test]
    async fn clear_forgives_a_locked_address() {
        let limiter = limiter(1);
        assert!(limiter.acquire("10.0.0.1").await.is_none());
        assert!(limiter.acquire("10.0.0.1").await.is_some());
        limiter.clear("10.0.0.1").await;
        assert!(limiter.acquire("10.0.0.1").await.is_none());
    }
}
