//! Store error taxonomy.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict { kind: Unique, constraint }` |
//! | Database (foreign key violation) | `23503` | `Conflict { kind: ForeignKey, constraint }` |
//! | RowNotFound | N/A | `NotFound` |
//! | Anything else | Any other | `Internal` |

use thiserror::Error;

/// Which kind of constraint rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Unique,
    ForeignKey,
}

impl core::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConflictKind::Unique => f.write_str("unique"),
            ConflictKind::ForeignKey => f.write_str("foreign key"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No row matched the lookup or update.
    #[error("record not found")]
    NotFound,

    /// A constraint rejected the write; `constraint` names it (e.g. `users_email_key`).
    #[error("{kind} constraint violated: {constraint}")]
    Conflict {
        kind: ConflictKind,
        constraint: String,
    },

    /// Anything else the driver reported. Opaque to callers.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn unique(constraint: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::Unique,
            constraint: constraint.into(),
        }
    }

    pub fn foreign_key(constraint: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::ForeignKey,
            constraint: constraint.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Name of the violated unique constraint, if this is a unique conflict.
    pub fn unique_violation(&self) -> Option<&str> {
        match self {
            StoreError::Conflict {
                kind: ConflictKind::Unique,
                constraint,
            } => Some(constraint),
            _ => None,
        }
    }
}

pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const FOREIGN_KEY_VIOLATION: &str = "23503";

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let constraint = db_err.constraint().unwrap_or("unknown").to_string();
            match db_err.code().as_deref() {
                Some(UNIQUE_VIOLATION) => StoreError::unique(constraint),
                Some(FOREIGN_KEY_VIOLATION) => StoreError::foreign_key(constraint),
                _ => StoreError::Internal(format!(
                    "database error in {}: {}",
                    operation,
                    db_err.message()
                )),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolClosed => {
            StoreError::Internal(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Internal(format!("sqlx error in {}: {}", operation, other)),
    }
}
