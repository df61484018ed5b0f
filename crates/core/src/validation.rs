//! Input validation rules for user-facing requests.
//!
//! Each rule returns `DomainError::Validation` with a human-readable reason.
//! Request handlers collect failures per field into `FieldViolation`s so the
//! caller sees every problem at once.

use crate::error::{DomainError, DomainResult, FieldViolation};

pub const USERNAME_LEN: (usize, usize) = (3, 100);
pub const PASSWORD_LEN: (usize, usize) = (6, 100);
pub const FULL_NAME_LEN: (usize, usize) = (3, 100);
pub const EMAIL_LEN: (usize, usize) = (3, 200);
pub const SECRET_CODE_LEN: usize = 32;

pub fn validate_length(value: &str, (min, max): (usize, usize)) -> DomainResult<()> {
    let n = value.chars().count();
    if n < min || n > max {
        return Err(DomainError::validation(format!(
            "must contain from {min}-{max} characters"
        )));
    }
    Ok(())
}

pub fn validate_username(value: &str) -> DomainResult<()> {
    validate_length(value, USERNAME_LEN)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(DomainError::validation(
            "must contain only lowercase letters, digits, or underscore",
        ));
    }
    Ok(())
}

pub fn validate_password(value: &str) -> DomainResult<()> {
    validate_length(value, PASSWORD_LEN)
}

pub fn validate_full_name(value: &str) -> DomainResult<()> {
    validate_length(value, FULL_NAME_LEN)?;
    if !value.chars().all(|c| c.is_alphabetic() || c == ' ') {
        return Err(DomainError::validation("must contain only letters or spaces"));
    }
    Ok(())
}

pub fn validate_email(value: &str) -> DomainResult<()> {
    validate_length(value, EMAIL_LEN)?;

    let invalid = || DomainError::validation("is not a valid email address");
    if value.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = value.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_verification_id(value: i64) -> DomainResult<()> {
    if value <= 0 {
        return Err(DomainError::validation("must be a positive integer"));
    }
    Ok(())
}

pub fn validate_secret_code(value: &str) -> DomainResult<()> {
    validate_length(value, (SECRET_CODE_LEN, SECRET_CODE_LEN))
}

/// Accumulates per-field failures.
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `result` against `field` if it failed.
    pub fn check(&mut self, field: &str, result: DomainResult<()>) -> &mut Self {
        if let Err(err) = result {
            let description = match err {
                DomainError::Validation(msg) => msg,
                other => other.to_string(),
            };
            self.0.push(FieldViolation::new(field, description));
        }
        self
    }

    /// `Ok(())` when nothing was recorded, otherwise `DomainError::InvalidArguments`.
    pub fn finish(self) -> DomainResult<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(DomainError::InvalidArguments(self.0))
        }
    }
}
