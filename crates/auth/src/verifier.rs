//! Token signing and verification.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use postbox_core::Role;

use crate::claims::{validate_payload, TokenError, TokenPayload};

pub const MIN_SECRET_KEY_LEN: usize = 32;

/// Capability consumed by request handlers: turn a bearer token into an identity.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<TokenPayload, TokenError>;
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secret key must be at least {MIN_SECRET_KEY_LEN} bytes")]
    TooShort,
}

/// HMAC-SHA256 signed tokens.
pub struct Hs256TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Hs256TokenVerifier {
    pub fn new(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.len() < MIN_SECRET_KEY_LEN {
            return Err(KeyError::TooShort);
        }

        // Expiry lives in the payload itself and is checked by `validate_payload`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Issue a signed token for `username`.
    pub fn issue(
        &self,
        username: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<(String, TokenPayload), TokenError> {
        let payload = TokenPayload::new(username, role, ttl, Utc::now());
        let token = encode(&Header::new(Algorithm::HS256), &payload, &self.encoding)
            .map_err(|_| TokenError::Invalid)?;
        Ok((token, payload))
    }
}

impl TokenVerifier for Hs256TokenVerifier {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<TokenPayload, TokenError> {
        let data = decode::<TokenPayload>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;

        validate_payload(&data.claims, now)?;
        Ok(data.claims)
    }
}
