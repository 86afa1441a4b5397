//! Authentication surface tests
//!
//! Token lifecycle, password policy, and role resolution exercised
//! through the library's public API. Flows that need a live Postgres or
//! Redis (rotation, lockout, blacklist persistence) are covered by their
//! components' own tests against those services.

use kehilla_directory_api::auth::password::{
    hash_password, validate_password_strength, verify_password,
};
use kehilla_directory_api::auth::roles;
use kehilla_directory_api::auth::tokens::{TokenKind, TokenManager};
use kehilla_directory_api::config::JwtSettings;
use kehilla_directory_api::errors::AppError;
use kehilla_directory_api::models::RoleGrant;
use pretty_assertions::assert_eq;

fn jwt_settings() -> JwtSettings {
    JwtSettings {
        secret: "integration-test-secret".to_string(),
        access_expire_hours: 0.25,
        refresh_expire_days: 30,
        clock_skew_leeway_secs: 0,
        issuer: "kehilla-directory".to_string(),
        kid: "primary".to_string(),
        jwks_url: None,
    }
}

#[test]
fn access_and_refresh_tokens_verify_against_their_kind() {
    let tm = TokenManager::new(jwt_settings());
    let roles = vec![RoleGrant::new("user", 1)];
    let permissions = vec!["profile:view".to_string()];

    let (access, access_ttl) = tm
        .mint_access_token("user-1", "member@example.com", &roles, &permissions, "sid-1", "fid-1")
        .unwrap();
    let (refresh, refresh_ttl) = tm
        .mint_refresh_token("user-1", "sid-1", "fid-1", 30 * 86_400)
        .unwrap();

    assert_eq!(access_ttl, 900);
    assert_eq!(refresh_ttl, 30 * 86_400);

    let claims = tm.verify(&access, TokenKind::Access).unwrap();
    assert_eq!(claims.uid, "user-1");
    assert_eq!(claims.sid, "sid-1");
    assert_eq!(claims.fid, "fid-1");
    assert_eq!(claims.permissions.unwrap(), permissions);

    let claims = tm.verify(&refresh, TokenKind::Refresh).unwrap();
    assert_eq!(claims.uid, "user-1");

    // A refresh token never authenticates a request, and vice versa.
    assert!(tm.verify(&refresh, TokenKind::Access).is_err());
    assert!(tm.verify(&access, TokenKind::Refresh).is_err());
}

#[test]
fn expired_access_token_reports_expiry() {
    let mut settings = jwt_settings();
    settings.access_expire_hours = -1.0;
    let tm = TokenManager::new(settings);
    let (token, _) = tm
        .mint_access_token("user-1", "member@example.com", &[], &[], "s", "f")
        .unwrap();
    assert!(matches!(
        tm.verify(&token, TokenKind::Access),
        Err(AppError::TokenExpired)
    ));
}

#[test]
fn password_policy_names_every_violated_rule() {
    let weak = validate_password_strength("weak");
    assert!(!weak.is_valid);
    assert_eq!(weak.max_score, 5);
    // length, uppercase, digit, symbol violated; lowercase satisfied.
    assert_eq!(weak.score, 1);
    assert_eq!(weak.issues.len(), 4);

    let strong = validate_password_strength("Sufficient1!");
    assert!(strong.is_valid);
    assert_eq!(strong.score, 5);
    assert!(strong.issues.is_empty());
}

#[test]
fn bcrypt_round_trip_and_rejection() {
    let hash = hash_password("Sufficient1!", 4).unwrap();
    assert!(hash.starts_with("$2"));
    assert!(verify_password("Sufficient1!", &hash));
    assert!(!verify_password("Sufficient1?", &hash));
}

#[test]
fn permission_resolution_spans_the_hierarchy() {
    let grants = vec![RoleGrant::new("system_admin", 3)];
    let permissions = roles::resolve_permissions(&grants);

    // Direct permissions.
    assert!(permissions.contains(&"user:manage".to_string()));
    // Implied through data_admin and moderator down to user.
    assert!(permissions.contains(&"data:export".to_string()));
    assert!(permissions.contains(&"content:moderate".to_string()));
    assert!(permissions.contains(&"profile:edit".to_string()));
    // But not super_admin's.
    assert!(!permissions.contains(&"role:manage".to_string()));
}

#[test]
fn admin_alias_and_canonical_name_are_equivalent() {
    let canonical = roles::resolve_permissions(&[RoleGrant::new("system_admin", 3)]);
    let alias = roles::resolve_permissions(&[RoleGrant::new("admin", 3)]);
    assert_eq!(canonical, alias);
    assert!(roles::is_admin(&[RoleGrant::new("admin", 3)]));
}

#[test]
fn guests_hold_no_elevated_permissions() {
    let permissions = roles::resolve_permissions(&[RoleGrant::new("guest", 0)]);
    assert_eq!(permissions, vec!["listing:view".to_string()]);
    assert!(!roles::is_admin(&[RoleGrant::new("guest", 0)]));
}
