use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use postbox_core::{Role, TokenId};

/// Payload carried by an access token once it has been decoded and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub id: TokenId,
    pub username: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl TokenPayload {
    pub fn new(username: impl Into<String>, role: Role, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: TokenId::new(),
            username: username.into(),
            role,
            issued_at: now,
            expired_at: now + ttl,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,
}

/// Deterministically validate the time window of a decoded payload.
pub fn validate_payload(payload: &TokenPayload, now: DateTime<Utc>) -> Result<(), TokenError> {
    if payload.expired_at <= payload.issued_at {
        return Err(TokenError::Invalid);
    }
    if now >= payload.expired_at {
        return Err(TokenError::Expired);
    }
    Ok(())
}
