//! Password hashing and strength policy
//!
//! bcrypt with a configurable cost factor. The strength policy is five
//! rules; the score counts how many the candidate satisfies.

use serde::Serialize;

use crate::errors::AppError;

const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Outcome of the strength policy.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordStrength {
    pub is_valid: bool,
    pub score: u8,
    pub max_score: u8,
    pub issues: Vec<String>,
}

/// Apply the five policy rules: length >= 8, one upper, one lower, one
/// digit, one symbol.
pub fn validate_password_strength(password: &str) -> PasswordStrength {
    let mut issues = Vec::new();
    let mut score = 0u8;

    if password.chars().count() >= 8 {
        score += 1;
    } else {
        issues.push("Password must be at least 8 characters long".to_string());
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        score += 1;
    } else {
        issues.push("Password must contain at least one uppercase letter".to_string());
    }
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        score += 1;
    } else {
        issues.push("Password must contain at least one lowercase letter".to_string());
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        score += 1;
    } else {
        issues.push("Password must contain at least one number".to_string());
    }
    if password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        score += 1;
    } else {
        issues.push("Password must contain at least one special character".to_string());
    }

    PasswordStrength {
        is_valid: issues.is_empty(),
        score,
        max_score: 5,
        issues,
    }
}

pub fn hash_password(password: &str, rounds: u32) -> Result<String, AppError> {
    if password.len() < 8 {
        return Err(AppError::ValidationMessage(
            "Password must be at least 8 characters long".to_string(),
        ));
    }
    bcrypt::hash(password, rounds)
        .map_err(|e| AppError::Internal(format!("Password hashing error: {e}")))
}

/// Constant-time verification. Hashes with the legacy `$2y$` prefix are
/// normalized to `$2b$` before checking.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let normalized = if hash.starts_with("$2y$") {
        hash.replacen("$2y$", "$2b$", 1)
    } else {
        hash.to_string()
    };
    match bcrypt::verify(password, &normalized) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!(error = %e, "password verification error");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("Str0ng!pw", true, 5)]
    #[case("short1!A", true, 5)]
    #[case("sh0rt!A", false, 4)] // too short
    #[case("alllower1!", false, 4)] // no uppercase
    #[case("ALLUPPER1!", false, 4)] // no lowercase
    #[case("NoDigits!!", false, 4)] // no number
    #[case("NoSymbol11", false, 4)] // no special character
    #[case("", false, 0)]
    fn strength_policy(#[case] password: &str, #[case] valid: bool, #[case] score: u8) {
        let result = validate_password_strength(password);
        assert_eq!(result.is_valid, valid);
        assert_eq!(result.score, score);
        assert_eq!(result.is_valid, result.issues.is_empty());
    }

    #[test]
    fn each_violation_is_named() {
        let result = validate_password_strength("abc");
        assert!(result.issues.iter().any(|m| m.contains("8 characters")));
        assert!(result.issues.iter().any(|m| m.contains("uppercase")));
        assert!(result.issues.iter().any(|m| m.contains("number")));
        assert!(result.issues.iter().any(|m| m.contains("special character")));
    }

    #[test]
    fn hash_and_verify_round_trip() {
        // Minimum cost keeps the test fast.
        let hash = hash_password("Str0ng!pw", 4).unwrap();
        assert!(verify_password("Str0ng!pw", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn short_passwords_are_rejected_before_hashing() {
        assert!(hash_password("short", 4).is_err());
    }

    #[test]
    fn legacy_prefix_is_normalized() {
        let hash = hash_password("Str0ng!pw", 4).unwrap();
        let legacy = hash.replacen("$2b$", "$2y$", 1);
        assert!(verify_password("Str0ng!pw", &legacy));
    }
}
