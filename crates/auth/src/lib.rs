//! `postbox-auth`: access-token boundary.
//!
//! Request handlers only consume the `TokenVerifier` capability; how tokens
//! are signed is decided here and nowhere else.

pub mod authorize;
pub mod claims;
pub mod verifier;

pub use authorize::{authorize_account, AuthzError};
pub use claims::{validate_payload, TokenError, TokenPayload};
pub use postbox_core::Role;
pub use verifier::{Hs256TokenVerifier, KeyError, TokenVerifier, MIN_SECRET_KEY_LEN};
