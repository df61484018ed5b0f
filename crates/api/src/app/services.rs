//! Use cases shared by the HTTP gateway and the RPC endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use postbox_auth::{authorize_account, TokenPayload};
use postbox_core::validation::{
    validate_email, validate_full_name, validate_password, validate_secret_code,
    validate_username, validate_verification_id, Violations,
};
use postbox_core::{Role, User};
use postbox_infra::db::{
    after_commit, create_user_tx, verify_email_tx, CreateUserParams, CreateUserTxParams, Store,
    TxError, UpdateUserParams, VerifyEmailTxParams,
};
use postbox_infra::tasks::{EnqueueOptions, SendVerifyEmailPayload, TaskDistributor};

use super::dto::{CreateUserRequest, UpdateUserRequest, VerifyEmailRequest};
use super::errors::ApiError;
use super::password::{hash_password, DEFAULT_COST};

/// Queue the verification e-mail task is sent to.
pub const VERIFY_EMAIL_QUEUE: &str = "critical";
pub const VERIFY_EMAIL_MAX_RETRY: u32 = 10;
pub const VERIFY_EMAIL_DELAY: Duration = Duration::from_secs(10);

/// Result of a create call. `side_effect_pending` means the user is stored
/// but the verification e-mail could not be scheduled.
#[derive(Debug, Clone)]
pub struct CreateUserOutcome {
    pub user: User,
    pub side_effect_pending: bool,
}

#[derive(Clone)]
pub struct AppServices {
    store: Arc<dyn Store>,
    distributor: TaskDistributor,
    password_cost: u32,
}

impl AppServices {
    pub fn new(store: Arc<dyn Store>, distributor: TaskDistributor) -> Self {
        Self {
            store,
            distributor,
            password_cost: DEFAULT_COST,
        }
    }

    /// bcrypt work factor for new password hashes.
    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    /// bcrypt is CPU-bound, so it runs off the async workers.
    async fn hash(&self, password: String) -> Result<String, ApiError> {
        let cost = self.password_cost;
        tokio::task::spawn_blocking(move || hash_password(&password, cost))
            .await
            .map_err(|e| ApiError::Internal(format!("password hashing aborted: {e}")))?
            .map_err(|e| ApiError::Internal(format!("cannot hash password: {e}")))
    }

    pub async fn create_user(&self, req: CreateUserRequest) -> Result<CreateUserOutcome, ApiError> {
        let mut violations = Violations::new();
        violations
            .check("username", validate_username(&req.username))
            .check("password", validate_password(&req.password))
            .check("full_name", validate_full_name(&req.full_name))
            .check("email", validate_email(&req.email));
        violations.finish()?;

        let hashed_password = self.hash(req.password).await?;
        let params = CreateUserParams {
            username: req.username,
            hashed_password,
            full_name: req.full_name,
            email: req.email,
            role: Role::Depositor,
        };

        let distributor = self.distributor.clone();
        let after_create = after_commit(move |user: User| async move {
            let payload = SendVerifyEmailPayload {
                username: user.username,
            };
            let options = EnqueueOptions::new()
                .queue(VERIFY_EMAIL_QUEUE)
                .process_in(VERIFY_EMAIL_DELAY)
                .max_retry(VERIFY_EMAIL_MAX_RETRY);
            distributor
                .distribute_send_verify_email(&payload, options)
                .await?;
            Ok(())
        });

        let username = params.username.clone();
        match create_user_tx(
            self.store.as_ref(),
            CreateUserTxParams {
                params,
                after_create,
            },
        )
        .await
        {
            Ok(user) => {
                info!(username = %user.username, "user created");
                Ok(CreateUserOutcome {
                    user,
                    side_effect_pending: false,
                })
            }
            Err(err @ TxError::AfterCommit { .. }) => {
                warn!(
                    username = %username,
                    error = %err,
                    "user created; verification e-mail not scheduled"
                );
                let user = self.store.get_user(&username).await?;
                Ok(CreateUserOutcome {
                    user,
                    side_effect_pending: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_user(
        &self,
        caller: &TokenPayload,
        req: UpdateUserRequest,
    ) -> Result<User, ApiError> {
        let mut violations = Violations::new();
        violations.check("username", validate_username(&req.username));
        if let Some(password) = &req.password {
            violations.check("password", validate_password(password));
        }
        if let Some(full_name) = &req.full_name {
            violations.check("full_name", validate_full_name(full_name));
        }
        if let Some(email) = &req.email {
            violations.check("email", validate_email(email));
        }
        violations.finish()?;

        authorize_account(caller, &req.username)?;

        let mut params = UpdateUserParams::for_user(req.username);
        params.full_name = req.full_name;
        params.email = req.email;
        if let Some(password) = req.password {
            params.hashed_password = Some(self.hash(password).await?);
            params.password_changed_at = Some(Utc::now());
        }

        self.store
            .update_user(params)
            .await
            .map_err(|e| ApiError::from_store(e, "user"))
    }

    pub async fn verify_email(&self, req: VerifyEmailRequest) -> Result<User, ApiError> {
        let mut violations = Violations::new();
        violations
            .check("email_id", validate_verification_id(req.email_id))
            .check("secret_code", validate_secret_code(&req.secret_code));
        violations.finish()?;

        let result = verify_email_tx(
            self.store.as_ref(),
            VerifyEmailTxParams {
                record_id: req.email_id,
                secret_code: req.secret_code,
            },
        )
        .await
        .map_err(|e| ApiError::from_store(e, "verification record"))?;

        info!(username = %result.user.username, "email verified");
        Ok(result.user)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use postbox_core::TaskId;
    use uuid::Uuid;
    use postbox_infra::db::InMemoryStore;
    use postbox_infra::tasks::{
        InMemoryTaskQueue, NewTask, QueueError, QueueStats, Task, TaskQueueStore,
        TASK_SEND_VERIFY_EMAIL,
    };

    use super::*;
    use crate::app::password::{check_password, MIN_COST};

    struct UnavailableQueue;

    fn down<T>() -> Result<T, QueueError> {
        Err(QueueError::Storage("queue unavailable".into()))
    }

    #[async_trait]
    impl TaskQueueStore for UnavailableQueue {
        async fn enqueue(&self, _task: NewTask) -> Result<Task, QueueError> {
            down()
        }
        async fn claim(&self, _queue: &str, _lease: Duration) -> Result<Option<Task>, QueueError> {
            down()
        }
        async fn reap_expired(&self, _queue: &str) -> Result<Vec<Task>, QueueError> {
            down()
        }
        async fn complete(&self, _id: TaskId, _lease_id: Uuid) -> Result<(), QueueError> {
            down()
        }
        async fn reschedule(
            &self,
            _id: TaskId,
            _lease_id: Uuid,
            _retry_count: u32,
            _process_at: DateTime<Utc>,
            _error: &str,
        ) -> Result<Task, QueueError> {
            down()
        }
        async fn archive(
            &self,
            _id: TaskId,
            _lease_id: Uuid,
            _error: &str,
        ) -> Result<Task, QueueError> {
            down()
        }
        async fn get(&self, _id: TaskId) -> Result<Option<Task>, QueueError> {
            down()
        }
        async fn list_archived(&self, _queue: &str, _limit: usize) -> Result<Vec<Task>, QueueError> {
            down()
        }
        async fn requeue_archived(&self, _id: TaskId) -> Result<Task, QueueError> {
            down()
        }
        async fn stats(&self, _queue: &str) -> Result<QueueStats, QueueError> {
            down()
        }
    }

    fn alice() -> CreateUserRequest {
        CreateUserRequest {
            username: "alice".into(),
            password: "secret123".into(),
            full_name: "Alice Liddell".into(),
            email: "alice@example.com".into(),
        }
    }

    fn services() -> (AppServices, Arc<InMemoryStore>, Arc<InMemoryTaskQueue>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let services = AppServices::new(store.clone(), TaskDistributor::new(queue.clone()))
            .with_password_cost(MIN_COST);
        (services, store, queue)
    }

    fn token(username: &str, role: Role) -> TokenPayload {
        TokenPayload::new(username, role, ChronoDuration::minutes(5), Utc::now())
    }

    #[tokio::test]
    async fn create_user_schedules_verification_email() {
        let (services, store, queue) = services();
        let before = Utc::now();

        let outcome = services.create_user(alice()).await.unwrap();
        assert!(!outcome.side_effect_pending);
        assert_eq!(outcome.user.role, Role::Depositor);
        assert!(check_password("secret123", &outcome.user.hashed_password));
        assert!(store.get_user("alice").await.is_ok());

        let tasks = queue.snapshot().unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.task_type, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(task.queue, VERIFY_EMAIL_QUEUE);
        assert_eq!(task.max_retry, VERIFY_EMAIL_MAX_RETRY);
        assert!(task.process_at >= before + ChronoDuration::seconds(10));
        let payload: SendVerifyEmailPayload = serde_json::from_slice(&task.payload).unwrap();
        assert_eq!(payload.username, "alice");
    }

    #[tokio::test]
    async fn duplicate_username_enqueues_nothing() {
        let (services, _store, queue) = services();
        services.create_user(alice()).await.unwrap();

        let mut again = alice();
        again.email = "other@example.com".into();
        let err = services.create_user(again).await.unwrap_err();

        assert!(matches!(err, ApiError::AlreadyExists(ref m) if m == "username already exists"));
        assert_eq!(queue.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_reports_every_field() {
        let (services, _store, queue) = services();
        let err = services
            .create_user(CreateUserRequest {
                username: "A!".into(),
                password: "123".into(),
                full_name: "Alice Liddell".into(),
                email: "nope".into(),
            })
            .await
            .unwrap_err();

        let fields: Vec<_> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["username", "password", "email"]);
        assert!(queue.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_after_commit_keeps_the_user() {
        let store = Arc::new(InMemoryStore::new());
        let services = AppServices::new(
            store.clone(),
            TaskDistributor::new(Arc::new(UnavailableQueue)),
        )
        .with_password_cost(MIN_COST);

        let outcome = services.create_user(alice()).await.unwrap();
        assert!(outcome.side_effect_pending);
        assert_eq!(store.get_user("alice").await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn password_hashing_failure_is_internal_and_stores_nothing() {
        let (services, store, queue) = services();
        let services = services.with_password_cost(MIN_COST - 1);

        let err = services.create_user(alice()).await.unwrap_err();

        assert!(matches!(err, ApiError::Internal(_)));
        assert!(store.get_user("alice").await.is_err());
        assert!(queue.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn depositor_cannot_update_someone_else() {
        let (services, _store, _queue) = services();
        services.create_user(alice()).await.unwrap();

        let err = services
            .update_user(
                &token("bob", Role::Depositor),
                UpdateUserRequest {
                    username: "alice".into(),
                    password: None,
                    full_name: Some("Mallory".into()),
                    email: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn password_update_rehashes_and_stamps_change_time() {
        let (services, _store, _queue) = services();
        let created = services.create_user(alice()).await.unwrap().user;

        let updated = services
            .update_user(
                &token("alice", Role::Depositor),
                UpdateUserRequest {
                    username: "alice".into(),
                    password: Some("new-secret".into()),
                    full_name: None,
                    email: None,
                },
            )
            .await
            .unwrap();

        assert!(check_password("new-secret", &updated.hashed_password));
        assert!(updated.password_changed_at > created.password_changed_at);
        assert_eq!(updated.full_name, created.full_name);
    }

    #[tokio::test]
    async fn banker_updating_missing_user_gets_not_found() {
        let (services, _store, _queue) = services();
        let err = services
            .update_user(
                &token("carol", Role::Banker),
                UpdateUserRequest {
                    username: "ghost".into(),
                    password: None,
                    full_name: Some("Nobody Here".into()),
                    email: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "user not found"));
    }

    #[tokio::test]
    async fn unknown_verification_record_is_not_found() {
        let (services, _store, _queue) = services();
        let err = services
            .verify_email(VerifyEmailRequest {
                email_id: 7,
                secret_code: "a".repeat(32),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
