//! The `email:verify` task: mail a one-time verification link to a new user.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{CreateVerificationRecordParams, Store, StoreError};
use crate::mail::{Message, Notifier};

use super::processor::TaskHandler;
use super::types::{Task, TaskError};

pub const TASK_SEND_VERIFY_EMAIL: &str = "email:verify";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendVerifyEmailPayload {
    pub username: String,
}

pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    /// Base of the link placed in the message, e.g. `http://localhost:8080/v1/verify_email`.
    verify_url: String,
    ttl: chrono::Duration,
}

impl SendVerifyEmailHandler {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        verify_url: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            verify_url: verify_url.into(),
            ttl,
        }
    }

    fn message(&self, full_name: &str, to: &str, record_id: i64, secret_code: &str) -> Message {
        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.verify_url, record_id, secret_code
        );
        Message {
            subject: "Please verify your e-mail address".to_string(),
            body: format!(
                "Hello {full_name},<br/>\
                 Thank you for registering with us!<br/>\
                 Please <a href=\"{link}\">click here</a> to verify your email address.<br/>"
            ),
            to: vec![to.to_string()],
        }
    }
}

/// 32 lowercase hex characters (122 random bits).
fn secret_code() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        let payload: SendVerifyEmailPayload = serde_json::from_slice(&task.payload)
            .context("failed to unmarshal payload")
            .map_err(TaskError::skip_retry)?;

        let user = match self.store.get_user(&payload.username).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                return Err(TaskError::skip_retry(anyhow!(
                    "user {} does not exist",
                    payload.username
                )));
            }
            Err(e) => return Err(TaskError::retry(anyhow!(e).context("failed to get user"))),
        };

        let record = self
            .store
            .create_verification_record(CreateVerificationRecordParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: secret_code(),
                expires_at: Utc::now() + self.ttl,
            })
            .await
            .context("failed to create verification record")?;

        let message = self.message(&user.full_name, &user.email, record.id, &record.secret_code);
        self.notifier
            .send(&message)
            .await
            .context("failed to send verification email")?;

        info!(
            task_type = %task.task_type,
            task_id = %task.id,
            email = %user.email,
            "processed task"
        );
        Ok(())
    }
}
