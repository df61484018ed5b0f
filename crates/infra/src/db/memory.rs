use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use postbox_core::{User, VerificationRecord};

use super::error::StoreError;
use super::queries::{
    CreateUserParams, CreateVerificationRecordParams, Queries, Store, StoreTx, UpdateUserParams,
    UpdateVerificationRecordParams, USERS_EMAIL_KEY, USERS_PKEY, VERIFY_EMAILS_USERNAME_FKEY,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerificationRecord>,
    last_verify_id: i64,
}

impl Tables {
    fn create_user(&mut self, params: CreateUserParams) -> Result<User, StoreError> {
        if self.users.contains_key(&params.username) {
            return Err(StoreError::unique(USERS_PKEY));
        }
        if self.users.values().any(|u| u.email == params.email) {
            return Err(StoreError::unique(USERS_EMAIL_KEY));
        }

        let now = Utc::now();
        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            role: params.role,
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    fn get_user(&self, username: &str) -> Result<User, StoreError> {
        self.users.get(username).cloned().ok_or(StoreError::NotFound)
    }

    fn update_user(&mut self, params: UpdateUserParams) -> Result<User, StoreError> {
        if let Some(email) = &params.email {
            let taken = self
                .users
                .values()
                .any(|u| &u.email == email && u.username != params.username);
            if taken {
                return Err(StoreError::unique(USERS_EMAIL_KEY));
            }
        }

        let user = self
            .users
            .get_mut(&params.username)
            .ok_or(StoreError::NotFound)?;

        if let Some(hashed_password) = params.hashed_password {
            user.hashed_password = hashed_password;
        }
        if let Some(changed_at) = params.password_changed_at {
            user.password_changed_at = changed_at;
        }
        if let Some(full_name) = params.full_name {
            user.full_name = full_name;
        }
        if let Some(email) = params.email {
            user.email = email;
        }
        if let Some(verified) = params.is_email_verified {
            user.is_email_verified = verified;
        }
        Ok(user.clone())
    }

    fn create_verification_record(
        &mut self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        if !self.users.contains_key(&params.username) {
            return Err(StoreError::foreign_key(VERIFY_EMAILS_USERNAME_FKEY));
        }

        self.last_verify_id += 1;
        let record = VerificationRecord {
            id: self.last_verify_id,
            username: params.username,
            email: params.email,
            secret_code: params.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expires_at: params.expires_at,
        };
        self.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_verification_record(&self, id: i64) -> Result<VerificationRecord, StoreError> {
        self.verify_emails
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update_verification_record(
        &mut self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        match self.verify_emails.get_mut(&params.id) {
            Some(record) if record.can_redeem(&params.secret_code, params.now) => {
                record.is_used = true;
                Ok(record.clone())
            }
            _ => Err(StoreError::NotFound),
        }
    }
}

/// In-memory user store.
///
/// Intended for tests/dev. Transactions hold the table lock for their whole
/// lifetime, so they are fully serialized and work against a staged copy
/// that only replaces the live tables on commit.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next transaction commit fail with `StoreError::Internal`.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

struct InMemoryTx {
    live: OwnedMutexGuard<Tables>,
    staged: Tables,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl Queries for InMemoryTx {
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User, StoreError> {
        self.staged.create_user(params)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.staged.get_user(username)
    }

    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User, StoreError> {
        self.staged.update_user(params)
    }

    async fn create_verification_record(
        &mut self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        self.staged.create_verification_record(params)
    }

    async fn get_verification_record(&mut self, id: i64) -> Result<VerificationRecord, StoreError> {
        self.staged.get_verification_record(id)
    }

    async fn update_verification_record(
        &mut self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        self.staged.update_verification_record(params)
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            mut live,
            staged,
            fail_commit,
        } = *self;

        if fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Internal("commit failed".to_string()));
        }
        *live = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let live = self.tables.clone().lock_owned().await;
        let staged = live.clone();
        Ok(Box::new(InMemoryTx {
            live,
            staged,
            fail_commit: self.fail_next_commit.clone(),
        }))
    }

    async fn create_user(&self, params: CreateUserParams) -> Result<User, StoreError> {
        self.tables.lock().await.create_user(params)
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        self.tables.lock().await.get_user(username)
    }

    async fn update_user(&self, params: UpdateUserParams) -> Result<User, StoreError> {
        self.tables.lock().await.update_user(params)
    }

    async fn create_verification_record(
        &self,
        params: CreateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        self.tables.lock().await.create_verification_record(params)
    }

    async fn get_verification_record(&self, id: i64) -> Result<VerificationRecord, StoreError> {
        self.tables.lock().await.get_verification_record(id)
    }

    async fn update_verification_record(
        &self,
        params: UpdateVerificationRecordParams,
    ) -> Result<VerificationRecord, StoreError> {
        self.tables.lock().await.update_verification_record(params)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use postbox_core::Role;

    use super::*;

    fn params(username: &str, email: &str) -> CreateUserParams {
        CreateUserParams {
            username: username.to_string(),
            hashed_password: "hash".to_string(),
            full_name: "Full Name".to_string(),
            email: email.to_string(),
            role: Role::Depositor,
        }
    }

    #[tokio::test]
    async fn duplicate_email_names_email_constraint() {
        let store = InMemoryStore::new();
        store.create_user(params("alice", "a@x.io")).await.unwrap();

        let err = store.create_user(params("bob", "a@x.io")).await.unwrap_err();
        assert_eq!(err.unique_violation(), Some(USERS_EMAIL_KEY));
    }

    #[tokio::test]
    async fn verification_record_requires_existing_user() {
        let store = InMemoryStore::new();

        let err = store
            .create_verification_record(CreateVerificationRecordParams {
                username: "ghost".into(),
                email: "g@x.io".into(),
                secret_code: "s".repeat(32),
                expires_at: Utc::now() + Duration::minutes(15),
            })
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::foreign_key(VERIFY_EMAILS_USERNAME_FKEY));
    }

    #[tokio::test]
    async fn expired_record_cannot_be_redeemed() {
        let store = InMemoryStore::new();
        store.create_user(params("alice", "a@x.io")).await.unwrap();
        let record = store
            .create_verification_record(CreateVerificationRecordParams {
                username: "alice".into(),
                email: "a@x.io".into(),
                secret_code: "s".repeat(32),
                expires_at: Utc::now() - Duration::seconds(1),
            })
            .await
            .unwrap();

        let err = store
            .update_verification_record(UpdateVerificationRecordParams {
                id: record.id,
                secret_code: "s".repeat(32),
                now: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields() {
        let store = InMemoryStore::new();
        let before = store.create_user(params("alice", "a@x.io")).await.unwrap();

        let mut update = UpdateUserParams::for_user("alice");
        update.full_name = Some("Alice Liddell".into());
        let after = store.update_user(update).await.unwrap();

        assert_eq!(after.full_name, "Alice Liddell");
        assert_eq!(after.email, before.email);
        assert_eq!(after.hashed_password, before.hashed_password);
    }

    #[tokio::test]
    async fn failed_commit_discards_staged_writes() {
        let store = InMemoryStore::new();
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.queries()
            .create_user(params("alice", "a@x.io"))
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());

        assert!(store.get_user("alice").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.queries()
                .create_user(params("alice", "a@x.io"))
                .await
                .unwrap();
        }
        assert!(store.get_user("alice").await.unwrap_err().is_not_found());
    }
}
