//! `postbox-core`: domain building blocks shared by every other crate.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod user;
pub mod validation;

pub use error::{DomainError, DomainResult, FieldViolation};
pub use id::{TaskId, TokenId};
pub use user::{Role, User, VerificationRecord};
