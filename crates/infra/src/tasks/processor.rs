//! Task processor: claims ready tasks by queue weight and runs their handlers.
//!
//! ```text
//!              ┌──────── Ok ────────► complete (delete)
//! claim ─► handler ── Retry, budget left ─► reschedule(retry_count + 1, backoff)
//!              ├──── Retry, exhausted ──► archive + report (RetryExhausted)
//!              └──── SkipRetry ─────────► archive + report (SkipRetry)
//! ```
//!
//! A claim whose lease runs out before it is settled (crashed or aborted
//! holder) is reaped as a failed attempt with cause `lease expired`.
//!
//! On shutdown the processor stops claiming and waits for in-flight
//! executions; unclaimed tasks stay in the queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::report::{FailureReason, FailureReporter, TerminalFailure};
use super::scheduler::{WeightError, WeightedQueues};
use super::store::{QueueError, TaskQueueStore, LEASE_EXPIRED};
use super::types::{offset, RetryPolicy, Task, TaskError, TaskState};

/// Handles every task of one type.
///
/// Delivery is at-least-once: handlers must tolerate seeing a task again.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        (self)(task).await
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// Queue names with their relative weights
    pub queues: Vec<(String, u32)>,
    /// Maximum concurrent executions
    pub concurrency: usize,
    /// Idle wait when every queue is empty
    pub poll_interval: Duration,
    /// Upper bound on a single execution
    pub task_timeout: Duration,
    /// How long a claim is held before it may be reaped; must exceed `task_timeout`
    pub lease: Duration,
    /// How often the run loop reaps expired leases
    pub reap_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            queues: vec![("critical".to_string(), 10), ("default".to_string(), 5)],
            concurrency: 10,
            poll_interval: Duration::from_millis(500),
            task_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(60),
            reap_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<S: Into<String>>(mut self, queues: impl IntoIterator<Item = (S, u32)>) -> Self {
        self.queues = queues.into_iter().map(|(n, w)| (n.into(), w)).collect();
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Queues(#[from] WeightError),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("lease ({lease:?}) must exceed the task timeout ({task_timeout:?})")]
    LeaseTooShort {
        lease: Duration,
        task_timeout: Duration,
    },
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub archived: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    archived: AtomicU64,
    in_flight: AtomicUsize,
}

/// Everything a single execution needs; cloned into each spawned task.
#[derive(Clone)]
struct Executor {
    queue: Arc<dyn TaskQueueStore>,
    reporter: Arc<dyn FailureReporter>,
    handlers: Arc<HashMap<String, Arc<dyn TaskHandler>>>,
    retry: RetryPolicy,
    task_timeout: Duration,
    stats: Arc<StatsCounters>,
}

impl Executor {
    async fn execute(&self, task: Task) {
        let Some(lease_id) = task.lease_id else {
            error!(task_id = %task.id, "claimed task carries no lease; skipping");
            return;
        };
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);

        let handler = self.handlers.get(&task.task_type).cloned();
        match handler {
            Some(handler) => {
                let result = self.invoke(handler, &task).await;
                self.settle(task, lease_id, result).await;
            }
            None => {
                let cause = format!("no handler registered for task type {}", task.task_type);
                self.fail_terminally(task, lease_id, cause, FailureReason::NoHandler)
                    .await;
            }
        }

        self.stats.processed.fetch_add(1, Ordering::SeqCst);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run the handler on its own task so a panic or timeout becomes a
    /// retryable failure instead of taking the processor down. The handler
    /// is aborted if this future is dropped.
    async fn invoke(&self, handler: Arc<dyn TaskHandler>, task: &Task) -> Result<(), TaskError> {
        let owned = task.clone();
        let mut handle =
            AbortOnDropHandle::new(tokio::spawn(async move { handler.handle(owned).await }));

        match tokio::time::timeout(self.task_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TaskError::retry(describe_join_error(join_err))),
            Err(_) => {
                handle.abort();
                Err(TaskError::retry(anyhow!(
                    "task timed out after {:?}",
                    self.task_timeout
                )))
            }
        }
    }

    async fn settle(&self, task: Task, lease_id: Uuid, result: Result<(), TaskError>) {
        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(task.id, lease_id).await {
                    log_settle_error(&task, "delete completed task", &e);
                    return;
                }
                self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                debug!(task_id = %task.id, task_type = %task.task_type, "task succeeded");
            }
            Err(TaskError::SkipRetry(cause)) => {
                let cause = format!("{cause:#}");
                self.fail_terminally(task, lease_id, cause, FailureReason::SkipRetry)
                    .await;
            }
            Err(TaskError::Retry(cause)) if task.has_retry_budget() => {
                self.reschedule(task, lease_id, format!("{cause:#}")).await;
            }
            Err(TaskError::Retry(cause)) => {
                let cause = format!("{cause:#}");
                self.fail_terminally(task, lease_id, cause, FailureReason::RetryExhausted)
                    .await;
            }
        }
    }

    async fn reschedule(&self, task: Task, lease_id: Uuid, cause: String) {
        let retry_count = task.retry_count + 1;
        let delay = self.retry.delay_for_retry(retry_count);
        let process_at = offset(Utc::now(), delay);

        match self
            .queue
            .reschedule(task.id, lease_id, retry_count, process_at, &cause)
            .await
        {
            Ok(_) => {
                self.stats.retried.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    retry_count,
                    max_retry = task.max_retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause,
                    "task failed; retry scheduled"
                );
            }
            Err(e) => log_settle_error(&task, "reschedule task", &e),
        }
    }

    async fn fail_terminally(
        &self,
        task: Task,
        lease_id: Uuid,
        cause: String,
        reason: FailureReason,
    ) {
        let task = match self.queue.archive(task.id, lease_id, &cause).await {
            Ok(archived) => archived,
            // Whoever holds the task now owns its outcome and its report.
            Err(e @ (QueueError::LeaseLost(_) | QueueError::InvalidState { .. })) => {
                log_settle_error(&task, "archive task", &e);
                return;
            }
            Err(e) => {
                log_settle_error(&task, "archive task", &e);
                task
            }
        };

        self.stats.archived.fetch_add(1, Ordering::SeqCst);
        self.reporter.report(&TerminalFailure {
            task,
            cause,
            reason,
        });
    }

    /// Recover expired leases on `queue`. Tasks archived by the reap get a
    /// terminal report like any other exhausted task.
    async fn reap(&self, queue: &str) -> Result<usize, QueueError> {
        let reaped = self.queue.reap_expired(queue).await?;
        let count = reaped.len();

        for task in reaped {
            if task.state == TaskState::Archived {
                self.stats.archived.fetch_add(1, Ordering::SeqCst);
                self.reporter.report(&TerminalFailure {
                    task,
                    cause: LEASE_EXPIRED.to_string(),
                    reason: FailureReason::RetryExhausted,
                });
            } else {
                self.stats.retried.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    retry_count = task.retry_count,
                    max_retry = task.max_retry,
                    "task lease expired; retry scheduled"
                );
            }
        }
        Ok(count)
    }
}

/// A lost lease means the task was recovered and is someone else's now.
fn log_settle_error(task: &Task, action: &str, err: &QueueError) {
    match err {
        QueueError::LeaseLost(_) | QueueError::InvalidState { .. } => {
            warn!(task_id = %task.id, error = %err, "lease lost; could not {action}");
        }
        _ => error!(task_id = %task.id, error = %err, "failed to {action}"),
    }
}

fn describe_join_error(err: JoinError) -> anyhow::Error {
    if err.is_panic() {
        anyhow!("task handler panicked")
    } else {
        anyhow!("task handler was cancelled")
    }
}

/// Pool of workers executing tasks from weighted queues.
pub struct TaskProcessor {
    executor: Executor,
    selector: Mutex<WeightedQueues>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueueStore>,
        reporter: Arc<dyn FailureReporter>,
        config: ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        if config.concurrency == 0 {
            return Err(ProcessorError::ZeroConcurrency);
        }
        if config.lease <= config.task_timeout {
            return Err(ProcessorError::LeaseTooShort {
                lease: config.lease,
                task_timeout: config.task_timeout,
            });
        }
        let selector = WeightedQueues::new(config.queues.clone())?;

        Ok(Self {
            executor: Executor {
                queue,
                reporter,
                handlers: Arc::new(HashMap::new()),
                retry: config.retry.clone(),
                task_timeout: config.task_timeout,
                stats: Arc::new(StatsCounters::default()),
            },
            selector: Mutex::new(selector),
            config,
        })
    }

    /// Register the handler for `task_type`, replacing any previous one.
    pub fn register<H>(&mut self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        Arc::make_mut(&mut self.executor.handlers).insert(task_type.into(), Arc::new(handler));
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> ProcessorStats {
        let s = &self.executor.stats;
        ProcessorStats {
            processed: s.processed.load(Ordering::SeqCst),
            succeeded: s.succeeded.load(Ordering::SeqCst),
            retried: s.retried.load(Ordering::SeqCst),
            archived: s.archived.load(Ordering::SeqCst),
            in_flight: s.in_flight.load(Ordering::SeqCst),
        }
    }

    fn poll_order(&self) -> Vec<String> {
        let mut selector = self.selector.lock().unwrap_or_else(PoisonError::into_inner);
        selector.next_round().map(str::to_owned).collect()
    }

    async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        for queue in self.poll_order() {
            if let Some(task) = self.executor.queue.claim(&queue, self.config.lease).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Recover expired leases on every configured queue. Returns how many
    /// tasks were recovered.
    pub async fn reap_expired(&self) -> Result<usize, QueueError> {
        let mut reaped = 0;
        for (queue, _) in &self.config.queues {
            reaped += self.executor.reap(queue).await?;
        }
        Ok(reaped)
    }

    /// Reap expired leases, then claim and execute one task inline. Returns
    /// whether a task was found.
    pub async fn process_one(&self) -> Result<bool, QueueError> {
        self.reap_expired().await?;
        match self.claim_next().await? {
            Some(task) => {
                self.executor.execute(task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process tasks until `shutdown` is cancelled, then drain in-flight work.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            processor = %self.config.name,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "task processor started"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        let mut next_reap = Instant::now();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(&self.config.name, joined);
            }

            if Instant::now() >= next_reap {
                match self.reap_expired().await {
                    Ok(0) => {}
                    Ok(reaped) => {
                        info!(processor = %self.config.name, reaped, "recovered expired leases");
                    }
                    Err(e) => {
                        error!(
                            processor = %self.config.name,
                            error = %e,
                            "failed to reap expired leases"
                        );
                    }
                }
                next_reap = Instant::now() + self.config.reap_interval;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(task)) => {
                    debug!(
                        processor = %self.config.name,
                        task_id = %task.id,
                        task_type = %task.task_type,
                        queue = %task.queue,
                        "claimed task"
                    );
                    let executor = self.executor.clone();
                    in_flight.spawn(async move {
                        executor.execute(task).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(processor = %self.config.name, error = %e, "failed to claim task");
                }
            }

            drop(permit);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            processor = %self.config.name,
            in_flight = in_flight.len(),
            "task processor draining"
        );
        while let Some(joined) = in_flight.join_next().await {
            log_join(&self.config.name, joined);
        }
        info!(processor = %self.config.name, "task processor stopped");
    }
}

fn log_join(processor: &str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(processor, error = %e, "task execution aborted");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use tokio::sync::Notify;

    use super::*;
    use crate::tasks::report::RecordingFailureReporter;
    use crate::tasks::store::InMemoryTaskQueue;
    use crate::tasks::types::{EnqueueOptions, NewTask, TaskState};

    fn config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_retry(RetryPolicy::fixed(Duration::ZERO))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn enqueue(queue: &InMemoryTaskQueue, task_type: &str, queue_name: &str, max_retry: u32) -> Task {
        let opts = EnqueueOptions::new().queue(queue_name).max_retry(max_retry);
        queue
            .enqueue(NewTask {
                task_type: task_type.into(),
                payload: br#"{"username":"alice"}"#.to_vec(),
                process_at: opts.process_at(Utc::now()),
                queue: opts.queue,
                max_retry: opts.max_retry,
            })
            .await
            .unwrap()
    }

    fn setup() -> (Arc<InMemoryTaskQueue>, Arc<RecordingFailureReporter>, TaskProcessor) {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let reporter = Arc::new(RecordingFailureReporter::new());
        let processor = TaskProcessor::new(queue.clone(), reporter.clone(), config()).unwrap();
        (queue, reporter, processor)
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let (queue, reporter, mut processor) = setup();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        processor.register("verify-email", move |_task: Task| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::retry(anyhow!("smtp unavailable")))
                } else {
                    Ok(())
                }
            }
        });

        let task = enqueue(&queue, "verify-email", "default", 3).await;

        assert!(processor.process_one().await.unwrap());
        let after_first = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.state, TaskState::Pending);
        assert_eq!(after_first.last_error.as_deref(), Some("smtp unavailable"));

        assert!(processor.process_one().await.unwrap());
        assert_eq!(queue.get(task.id).await.unwrap().unwrap().retry_count, 2);

        assert!(processor.process_one().await.unwrap());
        assert_eq!(queue.get(task.id).await.unwrap(), None);

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(reporter.failures().is_empty());
        let stats = processor.stats();
        assert_eq!((stats.retried, stats.succeeded, stats.archived), (2, 1, 0));
    }

    #[tokio::test]
    async fn exhausted_task_is_retried_exactly_max_retry_times() {
        let (queue, reporter, mut processor) = setup();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        processor.register("flaky", move |_task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TaskError::retry(anyhow!("still down")))
            }
        });

        let task = enqueue(&queue, "flaky", "default", 2).await;
        while processor.process_one().await.unwrap() {}

        // One first delivery plus `max_retry` retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, FailureReason::RetryExhausted);
        assert_eq!(failures[0].task.retry_count, 2);
        assert_eq!(failures[0].cause, "still down");

        let archived = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(archived.state, TaskState::Archived);
    }

    #[tokio::test]
    async fn skip_retry_runs_once_and_reports_once() {
        let (queue, reporter, mut processor) = setup();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        processor.register("verify-email", move |_task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TaskError::skip_retry(anyhow!("user does not exist")))
            }
        });

        enqueue(&queue, "verify-email", "default", 25).await;
        while processor.process_one().await.unwrap() {}

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, FailureReason::SkipRetry);
        assert_eq!(failures[0].task.retry_count, 0);
    }

    #[tokio::test]
    async fn unknown_task_type_is_archived() {
        let (queue, reporter, processor) = setup();
        let task = enqueue(&queue, "nobody:home", "critical", 5).await;

        assert!(processor.process_one().await.unwrap());

        assert_eq!(reporter.failures()[0].reason, FailureReason::NoHandler);
        assert_eq!(
            queue.get(task.id).await.unwrap().map(|t| t.state),
            Some(TaskState::Archived)
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let reporter = Arc::new(RecordingFailureReporter::new());
        let mut processor = TaskProcessor::new(
            queue.clone(),
            reporter.clone(),
            config().with_task_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        processor.register("slow", |_task: Task| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), TaskError>(())
        });

        enqueue(&queue, "slow", "default", 0).await;
        processor.process_one().await.unwrap();

        let failures = reporter.failures();
        assert_eq!(failures[0].reason, FailureReason::RetryExhausted);
        assert!(failures[0].cause.contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_handler_is_retried() {
        let (queue, _reporter, mut processor) = setup();
        processor.register("boom", |_task: Task| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<(), TaskError>(())
        });

        let task = enqueue(&queue, "boom", "default", 1).await;
        processor.process_one().await.unwrap();

        assert_eq!(queue.get(task.id).await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn weights_bias_service_two_to_one() {
        let (queue, _reporter, mut processor) = setup();
        let served = Arc::new(Mutex::new(Vec::<String>::new()));

        let log = served.clone();
        processor.register("work", move |task: Task| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(task.queue);
                Ok::<(), TaskError>(())
            }
        });

        for _ in 0..30 {
            enqueue(&queue, "work", "critical", 0).await;
            enqueue(&queue, "work", "default", 0).await;
        }
        for _ in 0..30 {
            processor.process_one().await.unwrap();
        }

        let served = served.lock().unwrap();
        let critical = served.iter().filter(|q| *q == "critical").count();
        assert_eq!(critical, 20);
        assert_eq!(served.len() - critical, 10);
    }

    #[tokio::test]
    async fn empty_high_weight_queue_does_not_block_others() {
        let (queue, _reporter, mut processor) = setup();
        processor.register("work", |_task: Task| async move { Ok::<(), TaskError>(()) });

        for _ in 0..3 {
            enqueue(&queue, "work", "default", 0).await;
        }
        for _ in 0..3 {
            assert!(processor.process_one().await.unwrap());
        }
        assert!(!processor.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_and_leaves_queued_tasks() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let reporter = Arc::new(RecordingFailureReporter::new());
        let mut processor = TaskProcessor::new(
            queue.clone(),
            reporter,
            config().with_concurrency(2),
        )
        .unwrap();

        let finished = Arc::new(AtomicU32::new(0));
        let counter = finished.clone();
        processor.register("slow", move |_task: Task| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TaskError>(())
            }
        });

        for _ in 0..5 {
            enqueue(&queue, "slow", "default", 3).await;
        }

        let processor = Arc::new(processor);
        let shutdown = CancellationToken::new();
        let running = {
            let processor = processor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { processor.run(shutdown).await })
        };

        while processor.stats().in_flight < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 2);
        let remaining = queue.snapshot().unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|t| t.state == TaskState::Pending));
    }

    /// Sets its flag when dropped, i.e. when the handler future goes away.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Decrements the running count when the handler finishes or is aborted.
    struct Running(Arc<AtomicU32>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_as_a_failed_attempt() {
        let (queue, reporter, mut processor) = setup();
        let seen = Arc::new(Mutex::new(Vec::<(u32, Option<String>)>::new()));

        let log = seen.clone();
        processor.register("verify-email", move |task: Task| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push((task.retry_count, task.last_error));
                Ok::<(), TaskError>(())
            }
        });

        let task = enqueue(&queue, "verify-email", "default", 3).await;
        // A holder that crashed right after claiming.
        queue.claim("default", Duration::ZERO).await.unwrap().unwrap();

        assert!(processor.process_one().await.unwrap());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Some(LEASE_EXPIRED.to_string()))]
        );
        assert_eq!(queue.get(task.id).await.unwrap(), None);
        assert!(reporter.failures().is_empty());
        assert_eq!(processor.stats().retried, 1);
    }

    #[tokio::test]
    async fn expired_lease_without_budget_is_archived_and_reported() {
        let (queue, reporter, mut processor) = setup();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        processor.register("verify-email", move |_task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TaskError>(())
            }
        });

        let task = enqueue(&queue, "verify-email", "critical", 0).await;
        queue.claim("critical", Duration::ZERO).await.unwrap().unwrap();

        assert!(!processor.process_one().await.unwrap());

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, FailureReason::RetryExhausted);
        assert_eq!(failures[0].cause, LEASE_EXPIRED);
        assert_eq!(failures[0].task.id, task.id);
        assert_eq!(
            queue.get(task.id).await.unwrap().map(|t| t.state),
            Some(TaskState::Archived)
        );
        assert_eq!(processor.stats().archived, 1);
    }

    #[tokio::test]
    async fn second_processor_never_runs_a_leased_task() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let reporter = Arc::new(RecordingFailureReporter::new());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let attempts = Arc::new(AtomicU32::new(0));

        let build = || {
            let mut processor = TaskProcessor::new(
                queue.clone(),
                reporter.clone(),
                config()
                    .with_task_timeout(Duration::from_millis(100))
                    .with_lease(Duration::from_millis(150)),
            )
            .unwrap();
            let (running, peak, attempts) = (running.clone(), peak.clone(), attempts.clone());
            processor.register("slow", move |_task: Task| {
                let (running, peak, attempts) = (running.clone(), peak.clone(), attempts.clone());
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _running = Running(running);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<(), TaskError>(())
                }
            });
            Arc::new(processor)
        };
        let (first, second) = (build(), build());

        enqueue(&queue, "slow", "default", 0).await;
        let holder = tokio::spawn(async move { first.process_one().await });

        let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
        while tokio::time::Instant::now() < deadline {
            second.process_one().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(holder.await.unwrap().unwrap());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].cause.contains("timed out"));
    }

    #[tokio::test]
    async fn aborting_the_worker_aborts_the_running_handler() {
        let (queue, _reporter, mut processor) = setup();
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));

        let (notify, flag) = (started.clone(), dropped.clone());
        processor.register("stuck", move |_task: Task| {
            let started = notify.clone();
            let guard = DropFlag(flag.clone());
            async move {
                let _guard = guard;
                started.notify_one();
                std::future::pending::<()>().await;
                Ok::<(), TaskError>(())
            }
        });

        enqueue(&queue, "stuck", "default", 3).await;
        let processor = Arc::new(processor);
        let worker = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process_one().await })
        };

        started.notified().await;
        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());

        let released = tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "handler kept running after its worker was aborted");
    }

    #[test]
    fn rejects_lease_that_does_not_outlast_the_timeout() {
        let queue: Arc<dyn TaskQueueStore> = Arc::new(InMemoryTaskQueue::new());
        let reporter: Arc<dyn FailureReporter> = Arc::new(RecordingFailureReporter::new());

        assert_eq!(
            TaskProcessor::new(
                queue,
                reporter,
                config()
                    .with_task_timeout(Duration::from_secs(60))
                    .with_lease(Duration::from_secs(60)),
            )
            .err(),
            Some(ProcessorError::LeaseTooShort {
                lease: Duration::from_secs(60),
                task_timeout: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn rejects_zero_concurrency_and_bad_queues() {
        let queue: Arc<dyn TaskQueueStore> = Arc::new(InMemoryTaskQueue::new());
        let reporter: Arc<dyn FailureReporter> = Arc::new(RecordingFailureReporter::new());

        assert_eq!(
            TaskProcessor::new(queue.clone(), reporter.clone(), config().with_concurrency(0)).err(),
            Some(ProcessorError::ZeroConcurrency)
        );
        assert_eq!(
            TaskProcessor::new(queue, reporter, config().with_queues([("critical", 0)])).err(),
            Some(ProcessorError::Queues(WeightError::ZeroWeight("critical".into())))
        );
    }
}
