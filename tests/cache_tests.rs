//! Cache substrate tests
//!
//! The L1 tier and the query fingerprinting exercised through the public
//! API; the cross-tier read-through and invalidation scenarios run in
//! environments with Redis and Postgres available.

use kehilla_directory_api::cache::MemoryCache;
use kehilla_directory_api::database::QueryCache;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn l1_set_then_get_then_tag_invalidate() {
    let cache = MemoryCache::new(100, 1);

    assert!(cache.set("a", json!(1), Some(60), &["g".into()]).await);
    assert!(cache.set("b", json!(2), Some(60), &["g".into()]).await);
    assert!(cache.set("c", json!(3), Some(60), &["h".into()]).await);

    assert_eq!(cache.get("a").await, Some(json!(1)));
    assert_eq!(cache.get("b").await, Some(json!(2)));

    let removed = cache.invalidate_by_tags(&["g".into()]).await;
    assert_eq!(removed, 2);
    assert_eq!(cache.get("a").await, None);
    assert_eq!(cache.get("b").await, None);
    assert_eq!(cache.get("c").await, Some(json!(3)));
}

#[tokio::test]
async fn l1_caps_hold_under_pressure() {
    let cache = MemoryCache::new(5, 1);
    for i in 0..50 {
        assert!(cache.set(&format!("k{i}"), json!(i), None, &[]).await);
        let stats = cache.stats().await;
        assert!(stats.size <= 5);
        assert!(stats.bytes_used <= stats.bytes_max);
    }
    let stats = cache.stats().await;
    assert_eq!(stats.size, 5);
    assert!(stats.evictions >= 45);
    // The newest keys survived.
    assert_eq!(cache.get("k49").await, Some(json!(49)));
    assert_eq!(cache.get("k0").await, None);
}

#[tokio::test]
async fn l1_ttl_expiry_is_a_miss() {
    let cache = MemoryCache::new(10, 1);
    cache.set("ephemeral", json!(true), Some(0), &[]).await;
    assert_eq!(cache.get("ephemeral").await, None);

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
}

#[test]
fn query_fingerprints_ignore_param_object_ordering() {
    // Same logical parameters, different JSON object insertion order.
    let a = QueryCache::fingerprint(
        "SELECT * FROM synagogues WHERE city = $1",
        &[json!({"city": "Miami", "limit": 50})],
    );
    let b = QueryCache::fingerprint(
        "SELECT * FROM synagogues WHERE city = $1",
        &[serde_json::from_str::<serde_json::Value>(r#"{"limit":50,"city":"Miami"}"#).unwrap()],
    );
    assert_eq!(a, b);
    assert_eq!(a.len(), 16);
}

#[test]
fn query_fingerprints_separate_distinct_statements() {
    let restaurants = QueryCache::fingerprint("SELECT * FROM restaurants", &[]);
    let mikvahs = QueryCache::fingerprint("SELECT * FROM mikvahs", &[]);
    assert_ne!(restaurants, mikvahs);
}
