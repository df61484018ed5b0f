//! Terminal failure reporting.
//!
//! A terminal failure never reaches the request that created the task (it has
//! long since returned); it is handed to a [`FailureReporter`] instead.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

use super::types::Task;

/// Why a task will not be delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Failed with `retry_count == max_retry`.
    RetryExhausted,
    /// The handler marked the failure permanent.
    SkipRetry,
    /// No handler is registered for the task type.
    NoHandler,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetryExhausted => "retry exhausted",
            FailureReason::SkipRetry => "skip retry",
            FailureReason::NoHandler => "no handler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
    pub task: Task,
    pub cause: String,
    pub reason: FailureReason,
}

/// Sink for terminal failures.
pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: &TerminalFailure);
}

/// Logs terminal failures at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureReporter;

impl FailureReporter for TracingFailureReporter {
    fn report(&self, failure: &TerminalFailure) {
        let task = &failure.task;
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            queue = %task.queue,
            payload = %String::from_utf8_lossy(&task.payload),
            retry_count = task.retry_count,
            max_retry = task.max_retry,
            reason = failure.reason.as_str(),
            cause = %failure.cause,
            "task failed terminally"
        );
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingFailureReporter {
    failures: Mutex<Vec<TerminalFailure>>,
}

impl RecordingFailureReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<TerminalFailure> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

impl FailureReporter for RecordingFailureReporter {
    fn report(&self, failure: &TerminalFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure.clone());
        }
    }
}
