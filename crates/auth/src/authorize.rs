use thiserror::Error;

use postbox_core::Role;

use crate::TokenPayload;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("cannot act on another user's account")]
    Forbidden,
}

/// Check that the token holder may act on `username`'s account.
///
/// Bankers may act on any account; everyone else only on their own.
pub fn authorize_account(payload: &TokenPayload, username: &str) -> Result<(), AuthzError> {
    match payload.role {
        Role::Banker => Ok(()),
        Role::Depositor if payload.username == username => Ok(()),
        Role::Depositor => Err(AuthzError::Forbidden),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn depositor_is_limited_to_own_account() {
        let p = TokenPayload::new("alice", Role::Depositor, Duration::minutes(1), Utc::now());
        assert_eq!(authorize_account(&p, "alice"), Ok(()));
        assert_eq!(authorize_account(&p, "bob"), Err(AuthzError::Forbidden));
    }

    #[test]
    fn banker_may_act_on_anyone() {
        let p = TokenPayload::new("carol", Role::Banker, Duration::minutes(1), Utc::now());
        assert_eq!(authorize_account(&p, "bob"), Ok(()));
    }
}
