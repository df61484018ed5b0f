use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::store::{QueueError, TaskQueueStore};
use super::types::{EnqueueOptions, NewTask, TaskInfo};
use super::verify_email::{SendVerifyEmailPayload, TASK_SEND_VERIFY_EMAIL};

#[derive(Debug, Error)]
pub enum DistributeError {
    /// The payload could not be encoded. A caller bug; never retried.
    #[error("failed to marshal task payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The queue store rejected or could not take the task.
    #[error("failed to enqueue task: {0}")]
    Enqueue(#[from] QueueError),
}

/// Enqueues typed tasks for the processor.
#[derive(Clone)]
pub struct TaskDistributor {
    queue: Arc<dyn TaskQueueStore>,
}

impl TaskDistributor {
    pub fn new(queue: Arc<dyn TaskQueueStore>) -> Self {
        Self { queue }
    }

    /// Enqueue an already-encoded payload.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<TaskInfo, DistributeError> {
        let task = self
            .queue
            .enqueue(NewTask {
                task_type: task_type.to_string(),
                payload,
                process_at: options.process_at(Utc::now()),
                queue: options.queue,
                max_retry: options.max_retry,
            })
            .await?;

        info!(
            task_type = %task.task_type,
            task_id = %task.id,
            queue = %task.queue,
            max_retry = task.max_retry,
            process_at = %task.process_at,
            "enqueued task"
        );
        Ok(TaskInfo::from(&task))
    }

    /// JSON-encode `payload` and enqueue it.
    pub async fn distribute<P>(
        &self,
        task_type: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<TaskInfo, DistributeError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(payload)?;
        self.enqueue(task_type, payload, options).await
    }

    pub async fn distribute_send_verify_email(
        &self,
        payload: &SendVerifyEmailPayload,
        options: EnqueueOptions,
    ) -> Result<TaskInfo, DistributeError> {
        self.distribute(TASK_SEND_VERIFY_EMAIL, payload, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tasks::store::InMemoryTaskQueue;
    use crate::tasks::types::TaskState;

    #[tokio::test]
    async fn options_land_on_the_stored_task() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let distributor = TaskDistributor::new(queue.clone());

        let before = Utc::now();
        let info = distributor
            .distribute_send_verify_email(
                &SendVerifyEmailPayload {
                    username: "alice".into(),
                },
                EnqueueOptions::new()
                    .queue("critical")
                    .max_retry(10)
                    .process_in(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        let task = queue.get(info.id).await.unwrap().unwrap();
        assert_eq!(task.task_type, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(task.queue, "critical");
        assert_eq!(task.max_retry, 10);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.process_at >= before + chrono::Duration::seconds(10));
        assert_eq!(task.payload, br#"{"username":"alice"}"#.to_vec());
    }

    #[tokio::test]
    async fn unserializable_payload_is_a_serialize_error() {
        let distributor = TaskDistributor::new(Arc::new(InMemoryTaskQueue::new()));

        // JSON object keys must be strings.
        let payload: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        let err = distributor
            .distribute("test", &payload, EnqueueOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DistributeError::Serialize(_)));
    }
}
