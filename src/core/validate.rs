//! Input validation. Failures are [`Error::Validation`] and never touch storage.

use regex::Regex;
use std::sync::LazyLock;

use super::error::{Error, Result};
use crate::models::Role;

const MAX_USERNAME_LENGTH: usize = 64;

/// Compiled once; `None` only if the pattern itself is broken.
static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// Normalize an email for lookup/uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    EMAIL
        .as_ref()
        .is_some_and(|re| re.is_match(email_normalized))
}

/// Normalized email, or a validation error.
pub fn email(email: &str) -> Result<String> {
    let normalized = normalize_email(email);
    if !valid_email(&normalized) {
        return Err(Error::validation("email", "malformed email address"));
    }
    Ok(normalized)
}

pub fn password(password: &str, min_length: usize) -> Result<()> {
    if password.chars().count() < min_length {
        return Err(Error::validation(
            "password",
            format!("must be at least {min_length} characters"),
        ));
    }
    Ok(())
}

pub fn username(username: &str) -> Result<String> {
    let trimmed = username.trim();
    if trimmed.chars().count() > MAX_USERNAME_LENGTH || trimmed.chars().any(char::is_control) {
        return Err(Error::validation("username", "malformed username"));
    }
    Ok(trimmed.to_string())
}

pub fn role(role: &str) -> Result<Role> {
    role.parse::<Role>()
        .map_err(|message| Error::validation("role", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn email_rejects_malformed_input() {
        assert_eq!(email("a@example.com").ok().as_deref(), Some("a@example.com"));
        for bad in ["", "a", "a@b", "a @example.com", "@example.com"] {
            let err = email(bad).err().map(|e| e.kind());
            assert_eq!(err, Some(ErrorKind::Validation), "{bad}");
        }
    }

    #[test]
    fn email_pattern_compiles() {
        assert!(EMAIL.is_some());
        assert!(valid_email("a@example.com"));
    }

    #[test]
    fn password_length_is_enforced() {
        assert!(password("12345678", 8).is_ok());
        assert!(password("1234567", 8).is_err());
    }

    #[test]
    fn username_is_trimmed() {
        assert_eq!(username("  bob ").ok().as_deref(), Some("bob"));
        assert!(username(&"x".repeat(65)).is_err());
        assert!(username("bad\nname").is_err());
    }

    #[test]
    fn roles_are_validated() {
        assert_eq!(role("admin").ok(), Some(Role::Admin));
        assert_eq!(role("root").err().map(|e| e.kind()), Some(ErrorKind::Validation));
    }
}
