//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use postbox_core::TaskId;

/// Queue a task lands in when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget applied when none is specified.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Where a task sits in its lifecycle. Succeeded tasks are deleted, so there
/// is no "completed" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for `process_at` (covers both immediate and scheduled tasks).
    Pending,
    /// Claimed by a processor and holding a lease.
    Active,
    /// Terminally failed; kept for inspection and manual requeue.
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "active" => Some(TaskState::Active),
            "archived" => Some(TaskState::Archived),
            _ => None,
        }
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of background work as persisted by the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Routing key for the handler registry (e.g. `email:verify`).
    pub task_type: String,
    /// Opaque to the queue; the encoding is the handler's contract.
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    pub retry_count: u32,
    /// Earliest instant the task may be claimed.
    pub process_at: DateTime<Utc>,
    pub state: TaskState,
    /// Fencing token of the current lease. Set on claim, cleared whenever the
    /// task leaves `Active`; settles must present it.
    pub lease_id: Option<Uuid>,
    /// Cause of the most recent failed attempt.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether another failed attempt may still be rescheduled.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retry
    }
}

/// A task as submitted to the queue store, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

/// What the distributor reports back about an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            queue: task.queue.clone(),
            max_retry: task.max_retry,
            process_at: task.process_at,
        }
    }
}

/// Delivery options for an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub delay: Duration,
    pub max_retry: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            delay: Duration::ZERO,
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }

    /// Hold the task back for `delay` after enqueue.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_retry(mut self, n: u32) -> Self {
        self.max_retry = n;
        self
    }

    pub(crate) fn process_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        offset(now, self.delay)
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry-1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(BackoffStrategy::Fixed),
            "exponential" => Some(BackoffStrategy::Exponential),
            "linear" => Some(BackoffStrategy::Linear),
            _ => None,
        }
    }
}

/// How long a failed task waits before its next delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi((retry - 1).min(1023) as i32),
            BackoffStrategy::Linear => base_ms * retry as f64,
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }
}

/// Failure returned by a task handler.
///
/// The variant decides the processor's next step: `Retry` reschedules while
/// budget remains, `SkipRetry` goes straight to terminal reporting.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0:#}")]
    Retry(anyhow::Error),

    #[error("skip retry: {0:#}")]
    SkipRetry(anyhow::Error),
}

impl TaskError {
    pub fn retry(cause: impl Into<anyhow::Error>) -> Self {
        Self::Retry(cause.into())
    }

    /// Permanent failure (malformed payload, missing entity, ...).
    pub fn skip_retry(cause: impl Into<anyhow::Error>) -> Self {
        Self::SkipRetry(cause.into())
    }

    pub fn is_skip_retry(&self) -> bool {
        matches!(self, TaskError::SkipRetry(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(cause: anyhow::Error) -> Self {
        Self::Retry(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(7), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn skip_retry_is_identified_by_variant() {
        let err = TaskError::skip_retry(anyhow::anyhow!("user does not exist"));
        assert!(err.is_skip_retry());
        assert_eq!(err.to_string(), "skip retry: user does not exist");

        let err: TaskError = anyhow::anyhow!("skip retry").into();
        assert!(!err.is_skip_retry());
    }

    #[test]
    fn enqueue_options_defaults() {
        let opts = EnqueueOptions::new();
        assert_eq!(opts.queue, DEFAULT_QUEUE);
        assert_eq!(opts.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(opts.delay, Duration::ZERO);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [TaskState::Pending, TaskState::Active, TaskState::Archived] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("done"), None);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..600_000,
            retry in 1u32..64,
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Exponential),
                Just(BackoffStrategy::Linear),
            ],
        ) {
            let policy = RetryPolicy {
                strategy,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
            };
            let this = policy.delay_for_retry(retry);
            let next = policy.delay_for_retry(retry + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= Duration::from_millis(cap_ms.max(base_ms)));
        }
    }
}
