//! Atomic multi-statement operations with optional commit hooks.
//!
//! ```text
//! begin ──► op(&mut dyn Queries) ──► commit ──► after-commit hook ──► return
//!               │ Err                  │ Err          │ Err
//!               ▼                      ▼              ▼
//!           rollback,              TxError::Store  TxError::AfterCommit
//!           TxError::Store                         (data is durable)
//! ```
//!
//! The after-commit hook is where a task gets enqueued (transactional outbox).
//! A hook failure does not undo the commit: the caller receives
//! `TxError::AfterCommit` and must treat the write as accepted with its side
//! effect uncertain, never retry the write itself.

use std::future::Future;

use chrono::Utc;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, warn};

use postbox_core::{User, VerificationRecord};

use super::error::StoreError;
use super::queries::{
    CreateUserParams, Queries, Store, UpdateUserParams, UpdateVerificationRecordParams,
};

/// Caller-supplied side effect run with the committed result.
pub type AfterCommitHook<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Wrap an async closure as an [`AfterCommitHook`].
pub fn after_commit<T, F, Fut>(f: F) -> AfterCommitHook<T>
where
    T: 'static,
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |value: T| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(value)) })
}

/// Outcome of a transactional operation that failed.
#[derive(Debug, Error)]
pub enum TxError {
    /// Nothing was committed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Hook run before commit failed; nothing was committed.
    #[error("transaction aborted by hook: {source}")]
    Aborted {
        #[source]
        source: anyhow::Error,
    },

    /// The write committed; the side effect may not have happened.
    #[error("committed, but after-commit hook failed: {source}")]
    AfterCommit {
        #[source]
        source: anyhow::Error,
    },
}

impl TxError {
    /// Whether the data written by the operation is durable.
    pub fn is_committed(&self) -> bool {
        matches!(self, TxError::AfterCommit { .. })
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            TxError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Run `op` inside one transaction: every statement commits or none does.
pub async fn execute_atomic<S, T, F>(store: &S, op: F) -> Result<T, StoreError>
where
    S: Store + ?Sized,
    T: Send,
    F: for<'c> FnOnce(&'c mut dyn Queries) -> BoxFuture<'c, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;

    let result = op(tx.queries()).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Like [`execute_atomic`], then run `hook` with the result once the commit
/// has succeeded. The hook never runs when the operation or commit fails.
pub async fn execute_atomic_then<S, T, F>(
    store: &S,
    op: F,
    hook: AfterCommitHook<T>,
) -> Result<T, TxError>
where
    S: Store + ?Sized,
    T: Clone + Send + 'static,
    F: for<'c> FnOnce(&'c mut dyn Queries) -> BoxFuture<'c, Result<T, StoreError>> + Send,
{
    let value = execute_atomic(store, op).await?;

    if let Err(source) = hook(value.clone()).await {
        error!(error = %source, "after-commit hook failed; write is durable");
        return Err(TxError::AfterCommit { source });
    }

    Ok(value)
}

/// Like [`execute_atomic`], but run `hook` inside the transaction right before
/// commit. A hook failure rolls the write back; a commit failure after a
/// successful hook leaves the hook's side effect without its write.
pub async fn execute_atomic_before_commit<S, T, F>(
    store: &S,
    op: F,
    hook: AfterCommitHook<T>,
) -> Result<T, TxError>
where
    S: Store + ?Sized,
    T: Clone + Send + 'static,
    F: for<'c> FnOnce(&'c mut dyn Queries) -> BoxFuture<'c, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;

    let result = op(tx.queries()).await;
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            return Err(err.into());
        }
    };

    if let Err(source) = hook(value.clone()).await {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "rollback failed");
        }
        return Err(TxError::Aborted { source });
    }

    tx.commit().await?;
    Ok(value)
}

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    /// Runs once the user row is committed (typically enqueues the
    /// verification e-mail task).
    pub after_create: AfterCommitHook<User>,
}

/// Create a user and fire `after_create` once the row is durable.
pub async fn create_user_tx<S>(store: &S, arg: CreateUserTxParams) -> Result<User, TxError>
where
    S: Store + ?Sized,
{
    let CreateUserTxParams {
        params,
        after_create,
    } = arg;

    execute_atomic_then(
        store,
        move |q| Box::pin(async move { q.create_user(params).await }),
        after_create,
    )
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxParams {
    pub record_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub record: VerificationRecord,
}

/// Redeem a verification code and mark the owner's address verified.
///
/// `StoreError::NotFound` when the record does not exist, was already used,
/// has expired or the code does not match.
pub async fn verify_email_tx<S>(
    store: &S,
    arg: VerifyEmailTxParams,
) -> Result<VerifyEmailTxResult, StoreError>
where
    S: Store + ?Sized,
{
    execute_atomic(store, move |q| {
        Box::pin(async move {
            let record = q
                .update_verification_record(UpdateVerificationRecordParams {
                    id: arg.record_id,
                    secret_code: arg.secret_code,
                    now: Utc::now(),
                })
                .await?;

            let mut update = UpdateUserParams::for_user(record.username.clone());
            update.is_email_verified = Some(true);
            let user = q.update_user(update).await?;

            Ok(VerifyEmailTxResult { user, record })
        })
    })
    .await
}
