//! Role hierarchy and permission resolution
//!
//! The hierarchy is fixed:
//! super_admin(4) > system_admin(3) > data_admin(2) > moderator(1)/user(1)
//! > guest(0). `admin` is accepted as an alias of `system_admin` at the
//! same level. Permissions resolve as the deduplicated union across a
//! user's roles plus everything implied below them.

use std::collections::BTreeSet;

use crate::models::RoleGrant;

pub const ROLE_SUPER_ADMIN: &str = "super_admin";
pub const ROLE_SYSTEM_ADMIN: &str = "system_admin";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_DATA_ADMIN: &str = "data_admin";
pub const ROLE_MODERATOR: &str = "moderator";
pub const ROLE_USER: &str = "user";
pub const ROLE_GUEST: &str = "guest";

/// Privilege level of a role name; unknown names carry no privilege.
pub fn role_level(role: &str) -> i32 {
    match role {
        ROLE_SUPER_ADMIN => 4,
        ROLE_SYSTEM_ADMIN | ROLE_ADMIN => 3,
        ROLE_DATA_ADMIN => 2,
        ROLE_MODERATOR | ROLE_USER => 1,
        ROLE_GUEST => 0,
        _ => 0,
    }
}

/// Roles an assignable admin grant may use.
pub fn is_grantable_role(role: &str) -> bool {
    matches!(
        role,
        ROLE_MODERATOR | ROLE_DATA_ADMIN | ROLE_SYSTEM_ADMIN | ROLE_ADMIN | ROLE_SUPER_ADMIN
    )
}

/// Direct permissions of one role, before hierarchy expansion.
pub fn role_permissions(role: &str) -> &'static [&'static str] {
    match role {
        ROLE_SUPER_ADMIN => &["role:manage", "admin:all", "system:all"],
        ROLE_SYSTEM_ADMIN | ROLE_ADMIN => &[
            "user:manage",
            "system:configure",
            "admin:manage",
            "security:manage",
        ],
        ROLE_DATA_ADMIN => &["data:view", "data:export", "analytics:view", "report:generate"],
        ROLE_MODERATOR => &["content:moderate", "user:view", "review:moderate"],
        ROLE_USER => &["profile:view", "profile:edit", "review:create", "favorite:manage"],
        ROLE_GUEST => &["listing:view"],
        _ => &[],
    }
}

/// Roles implied below a given role in the hierarchy.
pub fn implied_roles(role: &str) -> &'static [&'static str] {
    match role {
        ROLE_SUPER_ADMIN => &[ROLE_SYSTEM_ADMIN, ROLE_DATA_ADMIN, ROLE_MODERATOR, ROLE_USER],
        ROLE_SYSTEM_ADMIN | ROLE_ADMIN => &[ROLE_DATA_ADMIN, ROLE_MODERATOR, ROLE_USER],
        ROLE_DATA_ADMIN => &[ROLE_MODERATOR, ROLE_USER],
        ROLE_MODERATOR => &[ROLE_USER],
        _ => &[],
    }
}

/// Union of permissions across the user's roles and everything those
/// roles imply, deduplicated and sorted.
pub fn resolve_permissions(roles: &[RoleGrant]) -> Vec<String> {
    let mut permissions = BTreeSet::new();
    for grant in roles {
        for p in role_permissions(&grant.role) {
            permissions.insert((*p).to_string());
        }
        for implied in implied_roles(&grant.role) {
            for p in role_permissions(implied) {
                permissions.insert((*p).to_string());
            }
        }
    }
    permissions.into_iter().collect()
}

/// Highest privilege level across the user's roles.
pub fn max_level(roles: &[RoleGrant]) -> i32 {
    roles
        .iter()
        .map(|grant| grant.level.max(role_level(&grant.role)))
        .max()
        .unwrap_or(0)
}

/// Admin gate: system_admin or above.
pub fn is_admin(roles: &[RoleGrant]) -> bool {
    max_level(roles) >= 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn levels_are_monotone_with_privilege() {
        assert!(role_level(ROLE_SUPER_ADMIN) > role_level(ROLE_SYSTEM_ADMIN));
        assert!(role_level(ROLE_SYSTEM_ADMIN) > role_level(ROLE_DATA_ADMIN));
        assert!(role_level(ROLE_DATA_ADMIN) > role_level(ROLE_MODERATOR));
        assert!(role_level(ROLE_MODERATOR) > role_level(ROLE_GUEST));
        assert_eq!(role_level(ROLE_USER), role_level(ROLE_MODERATOR));
    }

    #[test]
    fn admin_is_an_alias_of_system_admin() {
        assert_eq!(role_level(ROLE_ADMIN), role_level(ROLE_SYSTEM_ADMIN));
        assert_eq!(role_permissions(ROLE_ADMIN), role_permissions(ROLE_SYSTEM_ADMIN));
    }

    #[test]
    fn unknown_roles_have_no_privilege() {
        assert_eq!(role_level("owner"), 0);
        assert!(role_permissions("owner").is_empty());
    }

    #[test]
    fn permissions_union_is_deduplicated() {
        let roles = vec![
            RoleGrant::new(ROLE_MODERATOR, 1),
            RoleGrant::new(ROLE_USER, 1),
        ];
        let permissions = resolve_permissions(&roles);
        assert!(permissions.contains(&"content:moderate".to_string()));
        assert!(permissions.contains(&"profile:edit".to_string()));
        let mut deduped = permissions.clone();
        deduped.dedup();
        assert_eq!(permissions, deduped);
    }

    #[test]
    fn hierarchy_expansion_includes_implied_permissions() {
        let roles = vec![RoleGrant::new(ROLE_SUPER_ADMIN, 4)];
        let permissions = resolve_permissions(&roles);
        // Direct.
        assert!(permissions.contains(&"role:manage".to_string()));
        // Implied through system_admin and user.
        assert!(permissions.contains(&"user:manage".to_string()));
        assert!(permissions.contains(&"profile:view".to_string()));
    }

    #[test]
    fn admin_gate_requires_level_three() {
        assert!(is_admin(&[RoleGrant::new(ROLE_SYSTEM_ADMIN, 3)]));
        assert!(is_admin(&[RoleGrant::new(ROLE_ADMIN, 3)]));
        assert!(!is_admin(&[RoleGrant::new(ROLE_MODERATOR, 1)]));
        assert!(!is_admin(&[]));
    }
}
