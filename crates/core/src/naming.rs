//! Release/record name rules.

use once_cell::sync::Lazy;
use regex::Regex;

pub const RELEASE_NAME_PATTERN: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
pub const RELEASE_NAME_MAX_LEN: usize = 53;

/// Length of the request-id prefix used in generated record names.
const REQUEST_ID_PREFIX_LEN: usize = 8;

static RELEASE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(RELEASE_NAME_PATTERN).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("release name is empty")]
    Empty,
    #[error("release name '{0}' exceeds 53 characters")]
    TooLong(String),
    #[error("release name '{0}' must be lowercase alphanumerics and dashes, starting and ending alphanumeric")]
    Pattern(String),
}

pub fn validate_release_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > RELEASE_NAME_MAX_LEN {
        return Err(ValidationError::TooLong(name.to_string()));
    }
    if !RELEASE_NAME_RE.is_match(name) {
        return Err(ValidationError::Pattern(name.to_string()));
    }
    Ok(())
}

/// Record name for a deployment request: the explicit release name, else
/// `<app>-<first 8 chars of request id>`.
pub fn record_name(app_name: &str, request_id: &str, release_name: Option<&str>) -> String {
    match release_name {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => {
            let prefix: String = request_id.chars().take(REQUEST_ID_PREFIX_LEN).collect();
            format!("{}-{}", app_name, prefix.to_ascii_lowercase())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_like_names() {
        for ok in ["a", "pg-1", "postgresql-1b2c3d4e", "0abc"] {
            assert!(validate_release_name(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(validate_release_name(""), Err(ValidationError::Empty));
        assert!(matches!(validate_release_name("-pg"), Err(ValidationError::Pattern(_))));
        assert!(matches!(validate_release_name("pg-"), Err(ValidationError::Pattern(_))));
        assert!(matches!(validate_release_name("Pg"), Err(ValidationError::Pattern(_))));
        let long = "a".repeat(54);
        assert!(matches!(validate_release_name(&long), Err(ValidationError::TooLong(_))));
        assert!(validate_release_name(&"a".repeat(53)).is_ok());
    }

    #[test]
    fn generated_name_uses_request_prefix() {
        assert_eq!(record_name("postgresql", "1B2C3D4E-5f6a-7b8c", None), "postgresql-1b2c3d4e");
        assert_eq!(record_name("postgresql", "abc", Some("")), "postgresql-abc");
        assert_eq!(record_name("postgresql", "1b2c3d4e", Some("db")), "db");
    }
}
