//! Background task pipeline with weighted queues, retry and terminal reporting.
//!
//! ## Components
//!
//! - `TaskQueueStore`: durable queue (Postgres or in-memory)
//! - `TaskDistributor`: enqueues typed tasks with delivery options
//! - `TaskProcessor`: claims tasks by queue weight, runs handlers, retries with backoff,
//!   reaps expired leases as failed attempts
//! - `FailureReporter`: sink for tasks that will not be delivered again

pub mod distributor;
pub mod postgres;
pub mod processor;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod verify_email;

pub use distributor::{DistributeError, TaskDistributor};
pub use postgres::PgTaskQueue;
pub use processor::{ProcessorConfig, ProcessorError, ProcessorStats, TaskHandler, TaskProcessor};
pub use report::{
    FailureReason, FailureReporter, RecordingFailureReporter, TerminalFailure,
    TracingFailureReporter,
};
pub use scheduler::{WeightError, WeightedQueues};
pub use store::{InMemoryTaskQueue, QueueError, QueueStats, TaskQueueStore, LEASE_EXPIRED};
pub use types::{
    BackoffStrategy, EnqueueOptions, NewTask, RetryPolicy, Task, TaskError, TaskInfo, TaskState,
    DEFAULT_MAX_RETRY, DEFAULT_QUEUE,
};
pub use verify_email::{SendVerifyEmailHandler, SendVerifyEmailPayload, TASK_SEND_VERIFY_EMAIL};
