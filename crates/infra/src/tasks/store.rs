//! Task queue storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use postbox_core::TaskId;

use super::types::{offset, NewTask, Task, TaskState};

/// Cause recorded on a task whose lease ran out before it was settled.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Durable, shared task queue.
///
/// Claims are mutually exclusive: two processors never hold the same task.
/// Every claim mints a fresh `lease_id`; settling requires the current one,
/// so a holder whose lease was recovered cannot overwrite the new outcome.
#[async_trait]
pub trait TaskQueueStore: Send + Sync {
    /// Persist a new pending task and assign its id.
    async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError>;

    /// Claim the next pending task on `queue` with `process_at <= now` and
    /// hold it for `lease`.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<Task>, QueueError>;

    /// Recover active tasks on `queue` whose lease has run out.
    ///
    /// An expired lease counts as a failed attempt: the task goes back to
    /// pending with `retry_count + 1`, or is archived once its budget is
    /// spent. Both carry [`LEASE_EXPIRED`] as `last_error`. Returns every
    /// recovered task in its new state.
    async fn reap_expired(&self, queue: &str) -> Result<Vec<Task>, QueueError>;

    /// Delete a task that finished successfully.
    async fn complete(&self, id: TaskId, lease_id: Uuid) -> Result<(), QueueError>;

    /// Put a failed task back to pending with an updated retry count.
    async fn reschedule(
        &self,
        id: TaskId,
        lease_id: Uuid,
        retry_count: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task, QueueError>;

    /// Move a task to the archive; it will not be delivered again.
    async fn archive(&self, id: TaskId, lease_id: Uuid, error: &str) -> Result<Task, QueueError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError>;

    async fn list_archived(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError>;

    /// Return an archived task to pending with a fresh retry budget.
    async fn requeue_archived(&self, id: TaskId) -> Result<Task, QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {id} is {state}")]
    InvalidState { id: TaskId, state: TaskState },
    #[error("lease on task {0} is held by another claim")]
    LeaseLost(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending and ready now.
    pub pending: usize,
    /// Pending with `process_at` in the future.
    pub scheduled: usize,
    pub active: usize,
    pub archived: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    task: Task,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_ready(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.task.queue == queue
            && self.task.state == TaskState::Pending
            && self.task.process_at <= now
    }

    fn is_expired(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.task.queue == queue
            && self.task.state == TaskState::Active
            && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    fn release(&mut self, state: TaskState, error: &str, now: DateTime<Utc>) {
        self.task.state = state;
        self.task.lease_id = None;
        self.task.last_error = Some(error.to_string());
        self.task.updated_at = now;
        self.lease_expires_at = None;
    }
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskQueue {
    entries: Arc<Mutex<HashMap<TaskId, Entry>>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TaskId, Entry>>, QueueError> {
        self.entries
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))
    }

    /// Every task currently held, in claim order.
    pub fn snapshot(&self) -> Result<Vec<Task>, QueueError> {
        let entries = self.lock()?;
        let mut tasks: Vec<Task> = entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| (t.process_at, t.id));
        Ok(tasks)
    }
}

/// The entry for `id`, provided it is active under `lease_id`.
fn leased_entry<'a>(
    entries: &'a mut HashMap<TaskId, Entry>,
    id: TaskId,
    lease_id: Uuid,
) -> Result<&'a mut Entry, QueueError> {
    let entry = entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
    if entry.task.state != TaskState::Active {
        return Err(QueueError::InvalidState {
            id,
            state: entry.task.state,
        });
    }
    if entry.task.lease_id != Some(lease_id) {
        return Err(QueueError::LeaseLost(id));
    }
    Ok(entry)
}

#[async_trait]
impl TaskQueueStore for InMemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError> {
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            task_type: task.task_type,
            payload: task.payload,
            queue: task.queue,
            max_retry: task.max_retry,
            retry_count: 0,
            process_at: task.process_at,
            state: TaskState::Pending,
            lease_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.lock()?.insert(
            task.id,
            Entry {
                task: task.clone(),
                lease_expires_at: None,
            },
        );
        Ok(task)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<Task>, QueueError> {
        let mut entries = self.lock()?;
        let now = Utc::now();

        let next = entries
            .values_mut()
            .filter(|e| e.is_ready(queue, now))
            .min_by_key(|e| (e.task.process_at, e.task.id));

        Ok(next.map(|entry| {
            entry.task.state = TaskState::Active;
            entry.task.lease_id = Some(Uuid::new_v4());
            entry.task.updated_at = now;
            entry.lease_expires_at = Some(offset(now, lease));
            entry.task.clone()
        }))
    }

    async fn reap_expired(&self, queue: &str) -> Result<Vec<Task>, QueueError> {
        let mut entries = self.lock()?;
        let now = Utc::now();

        let mut reaped = Vec::new();
        for entry in entries.values_mut().filter(|e| e.is_expired(queue, now)) {
            if entry.task.has_retry_budget() {
                entry.task.retry_count += 1;
                entry.task.process_at = now;
                entry.release(TaskState::Pending, LEASE_EXPIRED, now);
            } else {
                entry.release(TaskState::Archived, LEASE_EXPIRED, now);
            }
            reaped.push(entry.task.clone());
        }
        reaped.sort_by_key(|t| t.id);
        Ok(reaped)
    }

    async fn complete(&self, id: TaskId, lease_id: Uuid) -> Result<(), QueueError> {
        let mut entries = self.lock()?;
        leased_entry(&mut entries, id, lease_id)?;
        entries.remove(&id);
        Ok(())
    }

    async fn reschedule(
        &self,
        id: TaskId,
        lease_id: Uuid,
        retry_count: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task, QueueError> {
        let mut entries = self.lock()?;
        let entry = leased_entry(&mut entries, id, lease_id)?;

        entry.task.retry_count = retry_count;
        entry.task.process_at = process_at;
        entry.release(TaskState::Pending, error, Utc::now());
        Ok(entry.task.clone())
    }

    async fn archive(&self, id: TaskId, lease_id: Uuid, error: &str) -> Result<Task, QueueError> {
        let mut entries = self.lock()?;
        let entry = leased_entry(&mut entries, id, lease_id)?;

        entry.release(TaskState::Archived, error, Utc::now());
        Ok(entry.task.clone())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.lock()?.get(&id).map(|e| e.task.clone()))
    }

    async fn list_archived(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError> {
        let entries = self.lock()?;
        let mut archived: Vec<Task> = entries
            .values()
            .filter(|e| e.task.queue == queue && e.task.state == TaskState::Archived)
            .map(|e| e.task.clone())
            .collect();
        archived.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        archived.truncate(limit);
        Ok(archived)
    }

    async fn requeue_archived(&self, id: TaskId) -> Result<Task, QueueError> {
        let mut entries = self.lock()?;
        let entry = entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.task.state != TaskState::Archived {
            return Err(QueueError::InvalidState {
                id,
                state: entry.task.state,
            });
        }

        let now = Utc::now();
        entry.task.state = TaskState::Pending;
        entry.task.retry_count = 0;
        entry.task.process_at = now;
        entry.task.updated_at = now;
        Ok(entry.task.clone())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let entries = self.lock()?;
        let now = Utc::now();
        let mut stats = QueueStats::default();

        for entry in entries.values().filter(|e| e.task.queue == queue) {
            match entry.task.state {
                TaskState::Pending if entry.task.process_at <= now => stats.pending += 1,
                TaskState::Pending => stats.scheduled += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Archived => stats.archived += 1,
            }
        }
        Ok(stats)
    }
}
