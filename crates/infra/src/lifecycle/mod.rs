//! Process lifecycle: start the run-loops, fan out one shutdown signal, join.

mod coordinator;
mod workers;

pub use coordinator::{LifecycleCoordinator, LifecycleError, RunLoop, RunLoopState, RunLoopStates};
pub use workers::{run_loop_fn, FnRunLoop, TaskWorker};
