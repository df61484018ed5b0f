//! Joins independently started run-loops behind one cancellation token.
//!
//! ```text
//! Idle ──run()──► Running ──token cancelled──► Stopping ──► Stopped
//!                    │                            │
//!                    └──── error / panic ─────────┴──────► Failed
//! ```
//!
//! The first failure cancels the token so every other loop gets to stop
//! gracefully; the coordinator still waits for all of them before returning
//! that first error. Once cancelled, loops get `grace` to finish before they
//! are aborted.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-lived service unit: runs until `shutdown` is cancelled, then
/// performs its own graceful stop and returns.
#[async_trait]
pub trait RunLoop: Send {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RunLoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunLoopState::Stopped | RunLoopState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("run-loop {name} failed: {source:#}")]
    RunLoop {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("run-loop {name} panicked")]
    Panicked { name: String },

    #[error("run-loops still running after {grace:?} grace period: {names:?}")]
    GraceExpired { grace: Duration, names: Vec<String> },
}

/// Shared view of every registered loop's state.
#[derive(Debug, Clone, Default)]
pub struct RunLoopStates(Arc<Mutex<Vec<(String, RunLoopState)>>>);

impl RunLoopStates {
    pub fn snapshot(&self) -> Vec<(String, RunLoopState)> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, name: &str) -> Option<RunLoopState> {
        self.snapshot()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    fn push(&self, name: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, RunLoopState::Idle));
    }

    fn set(&self, idx: usize, state: RunLoopState) {
        if let Some(slot) = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(idx)
        {
            slot.1 = state;
        }
    }

    /// Move every loop in `from` to `to`; returns the names moved.
    fn transition(&self, from: &[RunLoopState], to: RunLoopState) -> Vec<String> {
        let mut states = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .iter_mut()
            .filter(|(_, s)| from.contains(s))
            .map(|(name, s)| {
                *s = to;
                name.clone()
            })
            .collect()
    }
}

pub struct LifecycleCoordinator {
    grace: Duration,
    shutdown: CancellationToken,
    loops: Vec<Box<dyn RunLoop>>,
    states: RunLoopStates,
}

impl LifecycleCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            shutdown: CancellationToken::new(),
            loops: Vec::new(),
            states: RunLoopStates::default(),
        }
    }

    pub fn register<R>(&mut self, run_loop: R)
    where
        R: RunLoop + 'static,
    {
        self.states.push(run_loop.name().to_string());
        self.loops.push(Box::new(run_loop));
    }

    /// The token every run-loop observes; cancelling it starts shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn states(&self) -> RunLoopStates {
        self.states.clone()
    }

    /// Cancel the token on SIGINT (ctrl-c) or SIGTERM.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctrl_c() => info!(signal = "SIGINT", "shutdown signal received"),
                _ = terminate() => info!(signal = "SIGTERM", "shutdown signal received"),
                _ = token.cancelled() => return,
            }
            token.cancel();
        })
    }

    /// Start every loop and wait until all of them have stopped.
    pub async fn run(self) -> Result<(), LifecycleError> {
        let LifecycleCoordinator {
            grace,
            shutdown,
            loops,
            states,
        } = self;

        let mut names = Vec::with_capacity(loops.len());
        let mut running = JoinSet::new();
        for (idx, run_loop) in loops.into_iter().enumerate() {
            let name = run_loop.name().to_string();
            let token = shutdown.clone();
            states.set(idx, RunLoopState::Running);
            info!(run_loop = %name, "run-loop started");
            running.spawn(async move {
                let outcome = AssertUnwindSafe(run_loop.run(token)).catch_unwind().await;
                (idx, outcome)
            });
            names.push(name);
        }

        let mut first_error: Option<LifecycleError> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let joined = match deadline {
                None => tokio::select! {
                    joined = running.join_next() => joined,
                    _ = shutdown.cancelled() => {
                        states.transition(&[RunLoopState::Running], RunLoopState::Stopping);
                        info!(grace_ms = grace.as_millis() as u64, "stopping run-loops");
                        deadline = Some(Instant::now() + grace);
                        continue;
                    }
                },
                Some(at) => match tokio::time::timeout_at(at, running.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let stuck = states.transition(
                            &[RunLoopState::Running, RunLoopState::Stopping],
                            RunLoopState::Failed,
                        );
                        error!(run_loops = ?stuck, "grace period expired; aborting");
                        running.abort_all();
                        while running.join_next().await.is_some() {}
                        first_error.get_or_insert(LifecycleError::GraceExpired {
                            grace,
                            names: stuck,
                        });
                        break;
                    }
                },
            };

            let Some(joined) = joined else { break };
            let (idx, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Only `abort_all` cancels these tasks; a panic is caught inside.
                    warn!(error = %e, "run-loop task ended abnormally");
                    continue;
                }
            };
            let name = names[idx].clone();

            match outcome {
                Ok(Ok(())) => {
                    states.set(idx, RunLoopState::Stopped);
                    info!(run_loop = %name, "run-loop stopped");
                }
                Ok(Err(source)) => {
                    states.set(idx, RunLoopState::Failed);
                    error!(run_loop = %name, error = %format!("{source:#}"), "run-loop failed");
                    first_error.get_or_insert(LifecycleError::RunLoop { name, source });
                    shutdown.cancel();
                }
                Err(_panic) => {
                    states.set(idx, RunLoopState::Failed);
                    error!(run_loop = %name, "run-loop panicked");
                    first_error.get_or_insert(LifecycleError::Panicked { name });
                    shutdown.cancel();
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
