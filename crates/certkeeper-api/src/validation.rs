//! Request payload validation

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ApiError;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-_.~A-Za-z0-9]+$").expect("static regex"))
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("static regex")
    })
}

/// Names may only contain letters, digits and `- _ . ~`, and cannot be blank
pub fn valid_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || !name_regex().is_match(name) {
        return Err(ApiError::Validation(format!("bad name '{name}'")));
    }
    Ok(())
}

pub fn valid_email(email: &str) -> Result<(), ApiError> {
    if !email_regex().is_match(email) {
        return Err(ApiError::Validation(format!("bad email '{email}'")));
    }
    Ok(())
}

/// Blank is allowed (no contact); anything else must be an email
pub fn valid_email_or_blank(email: &str) -> Result<(), ApiError> {
    if email.is_empty() {
        return Ok(());
    }
    valid_email(email)
}

/// RFC 5280 section 5.3.1 revocation reasons: 0 through 10, except the
/// unused value 7
pub fn valid_revocation_reason(reason: u8) -> Result<(), ApiError> {
    if reason == 7 || reason > 10 {
        return Err(ApiError::Validation(format!(
            "bad revocation reason code {reason}"
        )));
    }
    Ok(())
}

/// Directory selector for accounts
pub fn valid_directory(directory: &str) -> Result<(), ApiError> {
    match directory {
        "prod" | "staging" => Ok(()),
        other => Err(ApiError::Validation(format!("bad directory '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(valid_name("my-cert_1.example~x").is_ok());
        assert!(valid_name("Example.Com").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(valid_name("").is_err());
        assert!(valid_name("has space").is_err());
        assert!(valid_name("slash/name").is_err());
        assert!(valid_name("quest?ion").is_err());
        assert!(valid_name("caret^name").is_err());
    }

    #[test]
    fn test_emails() {
        assert!(valid_email("ops@example.com").is_ok());
        assert!(valid_email("first.last+tag@sub.example.io").is_ok());
        assert!(valid_email("not-an-email").is_err());
        assert!(valid_email("@example.com").is_err());
        assert!(valid_email("").is_err());

        assert!(valid_email_or_blank("").is_ok());
        assert!(valid_email_or_blank("nope").is_err());
    }

    #[test]
    fn test_revocation_reasons() {
        for reason in [0u8, 1, 2, 3, 4, 5, 6, 8, 9, 10] {
            assert!(valid_revocation_reason(reason).is_ok(), "reason {reason}");
        }
        assert!(valid_revocation_reason(7).is_err());
        assert!(valid_revocation_reason(11).is_err());
        assert!(valid_revocation_reason(255).is_err());
    }

    #[test]
    fn test_directories() {
        assert!(valid_directory("prod").is_ok());
        assert!(valid_directory("staging").is_ok());
        assert!(valid_directory("production").is_err());
        assert!(valid_directory("").is_err());
    }
}
