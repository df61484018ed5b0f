//! Run-loop adapters for the pieces this crate owns.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::RunLoop;
use crate::tasks::TaskProcessor;

/// Runs a [`TaskProcessor`] until shutdown; in-flight tasks drain first.
pub struct TaskWorker {
    processor: Arc<TaskProcessor>,
}

impl TaskWorker {
    pub fn new(processor: Arc<TaskProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl RunLoop for TaskWorker {
    fn name(&self) -> &str {
        self.processor.name()
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.processor.run(shutdown).await;
        Ok(())
    }
}

/// A run-loop built from a closure. Handy for one-off background loops.
pub struct FnRunLoop<F> {
    name: String,
    body: F,
}

pub fn run_loop_fn<F, Fut>(name: impl Into<String>, body: F) -> FnRunLoop<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnRunLoop {
        name: name.into(),
        body,
    }
}

#[async_trait]
impl<F, Fut> RunLoop for FnRunLoop<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        (self.body)(shutdown).await
    }
}
