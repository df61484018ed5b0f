//! Postgres-backed user store.
//!
//! Statements are written once as free functions generic over
//! [`sqlx::PgExecutor`], so the same SQL runs against the pool (standalone,
//! auto-committed) or against an open transaction.
//!
//! ## Thread Safety
//!
//! `PgStore` is `Send + Sync` and cheap to clone; the pool handles
//! connection management.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use postbox_core::{Role, User, VerificationRecord};

use super::error::{map_sqlx_error, StoreError};
use super::queries::{
    CreateUserParams, CreateVerificationRecordParams, Queries, Store, StoreTx, UpdateUserParams,
    UpdateVerificationRecordParams,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const USER_COLUMNS: &str = "username, hashed_password, full_name, email, role, \
     is_email_verified, password_changed_at, created_at";

const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expires_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

/// An open Postgres transaction. Dropped without commit, sqlx rolls it back.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Queries for PgStoreTx {
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, StoreError> {
        create_user(&mut *self.tx, params).await
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        get_user(&mut *self.tx, username).await
    }

    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User, StoreError> {
        update_user(&mut *self.tx, params).await
    }

    async fn create_verification_record(
        &mut self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        create_verification_record(&mut *self.tx, params).await
    }

    async fn get_verification_record(&mut self, id: i64) -> Result<VerificationRecord, StoreError> {
        get_verification_record(&mut *self.tx, id).await
    }

    async fn update_verification_record(
        &mut self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        update_verification_record(&mut *self.tx, params).await
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn create_user(&self, params: CreateUserParams) -> Result<User, StoreError> {
        create_user(&self.pool, params).await
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        get_user(&self.pool, username).await
    }

    async fn update_user(&self, params: UpdateUserParams) -> Result<User, StoreError> {
        update_user(&self.pool, params).await
    }

    async fn create_verification_record(
        &self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        create_verification_record(&self.pool, params).await
    }

    async fn get_verification_record(&self, id: i64) -> Result<VerificationRecord, StoreError> {
        get_verification_record(&self.pool, id).await
    }

    async fn update_verification_record(
        &self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        update_verification_record(&self.pool, params).await
    }
}

#[instrument(skip(exec, params), fields(username = %params.username), err)]
async fn create_user<'e, E: PgExecutor<'e>>(
    exec: E,
    params: CreateUserParams,
) -> Result<User, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO users (username, hashed_password, full_name, email, role) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
    ))
    .bind(&params.username)
    .bind(&params.hashed_password)
    .bind(&params.full_name)
    .bind(&params.email)
    .bind(params.role.as_str())
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("create_user", e))?;

    user_from_row(&row)
}

#[instrument(skip(exec), err)]
async fn get_user<'e, E: PgExecutor<'e>>(exec: E, username: &str) -> Result<User, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
    ))
    .bind(username)
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("get_user", e))?;

    user_from_row(&row)
}

#[instrument(skip(exec, params), fields(username = %params.username), err)]
async fn update_user<'e, E: PgExecutor<'e>>(
    exec: E,
    params: UpdateUserParams,
) -> Result<User, StoreError> {
    let row = sqlx::query(&format!(
        "UPDATE users SET \
             hashed_password = COALESCE($1, hashed_password), \
             password_changed_at = COALESCE($2, password_changed_at), \
             full_name = COALESCE($3, full_name), \
             email = COALESCE($4, email), \
             is_email_verified = COALESCE($5, is_email_verified) \
         WHERE username = $6 RETURNING {USER_COLUMNS}"
    ))
    .bind(params.hashed_password)
    .bind(params.password_changed_at)
    .bind(params.full_name)
    .bind(params.email)
    .bind(params.is_email_verified)
    .bind(&params.username)
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("update_user", e))?;

    user_from_row(&row)
}

#[instrument(skip(exec, params), fields(username = %params.username), err)]
async fn create_verification_record<'e, E: PgExecutor<'e>>(
    exec: E,
    params: CreateVerificationRecordParams,
) -> Result<VerificationRecord, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO verify_emails (username, email, secret_code, expires_at) \
         VALUES ($1, $2, $3, $4) RETURNING {VERIFY_EMAIL_COLUMNS}"
    ))
    .bind(&params.username)
    .bind(&params.email)
    .bind(&params.secret_code)
    .bind(params.expires_at)
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("create_verification_record", e))?;

    record_from_row(&row)
}

#[instrument(skip(exec), err)]
async fn get_verification_record<'e, E: PgExecutor<'e>>(
    exec: E,
    id: i64,
) -> Result<VerificationRecord, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1 LIMIT 1"
    ))
    .bind(id)
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("get_verification_record", e))?;

    record_from_row(&row)
}

#[instrument(skip(exec, params), fields(id = params.id), err)]
async fn update_verification_record<'e, E: PgExecutor<'e>>(
    exec: E,
    params: UpdateVerificationRecordParams,
) -> Result<VerificationRecord, StoreError> {
    // Matches nothing (RowNotFound) unless the record is redeemable.
    let row = sqlx::query(&format!(
        "UPDATE verify_emails SET is_used = TRUE \
         WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expires_at > $3 \
         RETURNING {VERIFY_EMAIL_COLUMNS}"
    ))
    .bind(params.id)
    .bind(&params.secret_code)
    .bind(params.now)
    .fetch_one(exec)
    .await
    .map_err(|e| map_sqlx_error("update_verification_record", e))?;

    record_from_row(&row)
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Internal(format!("failed to decode user row: {e}"));

    let role: String = row.try_get("role").map_err(decode)?;
    let role = Role::parse(&role)
        .ok_or_else(|| StoreError::Internal(format!("unknown role in users row: {role}")))?;

    Ok(User {
        username: row.try_get("username").map_err(decode)?,
        hashed_password: row.try_get("hashed_password").map_err(decode)?,
        full_name: row.try_get("full_name").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        role,
        is_email_verified: row.try_get("is_email_verified").map_err(decode)?,
        password_changed_at: row
            .try_get::<DateTime<Utc>, _>("password_changed_at")
            .map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
    })
}

fn record_from_row(row: &PgRow) -> Result<VerificationRecord, StoreError> {
    let decode =
        |e: sqlx::Error| StoreError::Internal(format!("failed to decode verify_emails row: {e}"));

    Ok(VerificationRecord {
        id: row.try_get("id").map_err(decode)?,
        username: row.try_get("username").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        secret_code: row.try_get("secret_code").map_err(decode)?,
        is_used: row.try_get("is_used").map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at").map_err(decode)?,
    })
}
