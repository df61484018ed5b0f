//! User persistence and atomic multi-statement operations.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod queries;
pub mod tx;

pub use error::{ConflictKind, StoreError};
pub use memory::InMemoryStore;
pub use postgres::{PgStore, PgStoreTx};
pub use queries::{
    CreateUserParams, CreateVerificationRecordParams, Queries, Store, StoreTx, UpdateUserParams,
    UpdateVerificationRecordParams, USERS_EMAIL_KEY, USERS_PKEY, VERIFY_EMAILS_USERNAME_FKEY,
};
pub use tx::{
    after_commit, create_user_tx, execute_atomic, execute_atomic_before_commit,
    execute_atomic_then, verify_email_tx, AfterCommitHook, CreateUserTxParams, TxError,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
