//! Companion task-execution kernel.
//!
//! A priority-preemptive microscheduler: a bounded pool of workers
//! multiplexed across three priority classes, with cooperative preemption of
//! background work and checkpointed resume.
//!
//! - **[`task`]** -- Task descriptors, priority classes, and status
//!   snapshots.
//! - **[`state`]** -- The checkpoint/restore capability a task implements to
//!   survive preemption, plus the stateless [`NoState`] sentinel.
//! - **[`interrupt`]** -- The cooperative interruption surface handed to
//!   every compute invocation.
//! - **[`executor`]** -- Submission, result delivery, and lifecycle, built
//!   on [`flume`] bounded lanes and [`tokio`] workers.
//! - **[`config`]** -- Worker-pool shape, queue bounds, and the per-worker
//!   resource factory.
//! - **[`error`]** -- Unified scheduler error type via [`thiserror`].
//!
//! Interactive (`Ui`) work is always dispatched before `Critical`, and
//! `Critical` before `Background`.  With two or more workers the pool is
//! partitioned by class and nothing is ever preempted; with exactly one
//! worker, an interactive arrival interrupts running background work, which
//! may checkpoint its state and resume later from where it left off.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod state;
pub mod task;

mod dispatcher;
mod queue;
mod worker;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::{
    DEFAULT_QUEUE_CAPACITY, ResourceFactory, SchedulerConfig, WorkerClass, WorkerResource,
};
pub use error::{Result, SchedulerError};
pub use executor::{Executor, TaskHandle};
pub use interrupt::{InterruptControl, InterruptSignal};
pub use state::{NoState, StateCapability};
pub use task::{
    ComputeFn, ComputeResult, Priority, Task, TaskContext, TaskId, TaskInfo, TaskStatus,
    TaskValue, compute_fn,
};
