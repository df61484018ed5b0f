//! Store capability: single-row operations and transaction handles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use postbox_core::{Role, User, VerificationRecord};

use super::error::StoreError;

pub const USERS_PKEY: &str = "users_pkey";
pub const USERS_EMAIL_KEY: &str = "users_email_key";
pub const VERIFY_EMAILS_USERNAME_FKEY: &str = "verify_emails_username_fkey";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
}

/// Partial update of a user; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UpdateUserParams {
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerificationRecordParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub expires_at: DateTime<Utc>,
}

/// Marks a record used.
///
/// The update only matches a record that is still unused, unexpired at `now`
/// and carries `secret_code`; anything else is `StoreError::NotFound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateVerificationRecordParams {
    pub id: i64,
    pub secret_code: String,
    pub now: DateTime<Utc>,
}

/// Statement-level operations available inside a transaction.
///
/// Object-safe so transactional closures can take `&mut dyn Queries`.
#[async_trait]
pub trait Queries: Send {
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User, StoreError>;

    async fn create_verification_record(
        &mut self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError>;

    async fn get_verification_record(&mut self, id: i64) -> Result<VerificationRecord, StoreError>;

    async fn update_verification_record(
        &mut self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    fn queries(&mut self) -> &mut dyn Queries;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Shared, pool-backed store. Every method outside `begin` is independently atomic.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn create_user(&self, params: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&self, params: UpdateUserParams) -> Result<User, StoreError>;

    async fn create_verification_record(
        &self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError>;

    async fn get_verification_record(&self, id: i64) -> Result<VerificationRecord, StoreError>;

    async fn update_verification_record(
        &self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError>;
}
