//! Outbound notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub subject: String,
    /// HTML body.
    pub body: String,
    pub to: Vec<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("message has no recipients")]
    NoRecipients,
    #[error("relay rejected message with status {0}")]
    Rejected(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Delivers messages to people.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), NotifyError>;
}

fn ensure_recipients(message: &Message) -> Result<(), NotifyError> {
    if message.to.is_empty() {
        return Err(NotifyError::NoRecipients);
    }
    Ok(())
}

/// Writes messages to the log instead of delivering them (dev default).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        ensure_recipients(message)?;
        info!(
            to = ?message.to,
            subject = %message.subject,
            body = %message.body,
            "notification (log only)"
        );
        Ok(())
    }
}

/// POSTs each message as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        ensure_recipients(message)?;

        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        debug!(to = ?message.to, status = status.as_u16(), "notification relayed");
        Ok(())
    }
}

/// Stores messages in memory; can be told to fail the next N sends.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Message>>,
    failures_left: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        ensure_recipients(message)?;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotifyError::Transport("injected failure".to_string()));
        }

        self.sent
            .lock()
            .map_err(|_| NotifyError::Transport("lock poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}
