//! Task descriptors and status snapshots.
//!
//! A [`Task`] describes one unit of work: a name for diagnostics, a priority
//! class, an async compute callable, and optionally a state value that can be
//! checkpointed across preemptions.  The compute receives a
//! [`TaskContext`] carrying the worker's opaque resource, the (possibly
//! restored) state, and the interruption surface.
//!
//! # Priority model
//!
//! Three classes, strictly ordered: **Ui** before **Critical** before
//! **Background**.  UI and Critical work always runs to completion; only
//! Background work is ever preempted, and only in the single-worker
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WorkerResource;
use crate::interrupt::{InterruptControl, InterruptSignal};
use crate::state::StateCapability;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique, time-ordered task identifier (UUID v7).
pub type TaskId = Uuid;

/// Value produced by a successful compute invocation.
pub type TaskValue = serde_json::Value;

/// What a compute invocation resolves to.
pub type ComputeResult = std::result::Result<TaskValue, anyhow::Error>;

/// Priority class that determines the scheduling lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Interactive work; always dispatched first.
    Ui = 0,
    /// Important non-interactive work; runs before anything Background.
    Critical = 1,
    /// Best-effort work; preemptible in the single-worker configuration.
    Background = 2,
}

/// Everything a compute invocation gets to work with.
pub struct TaskContext {
    /// The worker's opaque resource, minted once at startup and shared by
    /// every invocation the worker runs.
    pub resource: WorkerResource,
    /// The task's state, restored from the latest checkpoint when one exists.
    pub state: Box<dyn StateCapability>,
    /// Checkpointing and reschedule policy surface.
    pub control: InterruptControl,
    /// The invocation's interrupt signal; latches high on preemption or
    /// cancellation and stays set.
    pub signal: InterruptSignal,
}

impl TaskContext {
    /// Downcast the state to its concrete type.
    pub fn state_mut<T: StateCapability>(&mut self) -> Option<&mut T> {
        self.state.downcast_mut::<T>()
    }
}

/// The async callable the scheduler executes, re-invocable across reschedule
/// attempts.
///
/// Borrowing the context for the duration of the returned future lets compute
/// mutate its state in place without giving up ownership to the scheduler.
pub type ComputeFn = Arc<
    dyn for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, ComputeResult> + Send + Sync,
>;

/// Wrap a closure as a [`ComputeFn`].
///
/// ```rust
/// # use companion_scheduler::compute_fn;
/// use futures::FutureExt;
/// let compute = compute_fn(|_ctx| async move { Ok(serde_json::json!("ok")) }.boxed());
/// ```
pub fn compute_fn<F>(f: F) -> ComputeFn
where
    F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, ComputeResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Descriptor of one unit of work.
pub struct Task {
    /// Human-readable identifier, used in diagnostics only.
    pub name: String,
    /// Scheduling lane.
    pub priority: Priority,
    /// Lower bound on work time, honoured by sleeping before compute runs.
    /// Zero means no artificial delay.
    pub min_duration: Duration,
    /// The work itself.
    pub compute: ComputeFn,
    /// State to checkpoint across preemptions.  `None` substitutes the
    /// [`NoState`](crate::NoState) sentinel.
    pub initial_state: Option<Box<dyn StateCapability>>,
}

impl Task {
    /// Create a stateless task with no minimum duration.
    pub fn new(name: impl Into<String>, priority: Priority, compute: ComputeFn) -> Self {
        Self {
            name: name.into(),
            priority,
            min_duration: Duration::ZERO,
            compute,
            initial_state: None,
        }
    }
}

/// Lifecycle state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Sitting in its priority queue, waiting for a worker.
    Queued,
    /// Currently executing.
    Running,
    /// Interrupted mid-run and parked on the reschedule stack.
    Preempted,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

/// Metadata snapshot of a task visible to external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of times a worker has started this task; grows by one on every
    /// resume after preemption.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Status board (crate-internal)
// ---------------------------------------------------------------------------

/// Authoritative task metadata, shared between the executor and its workers.
#[derive(Clone, Default)]
pub(crate) struct StatusBoard {
    tasks: Arc<DashMap<TaskId, TaskInfo>>,
}

impl StatusBoard {
    pub(crate) fn insert(&self, id: TaskId, name: &str, priority: Priority) {
        self.tasks.insert(
            id,
            TaskInfo {
                id,
                name: name.to_owned(),
                priority,
                status: TaskStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error: None,
                attempts: 0,
            },
        );
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub(crate) fn mark_running(&self, id: TaskId) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.status = TaskStatus::Running;
            entry.attempts += 1;
            if entry.started_at.is_none() {
                entry.started_at = Some(Utc::now());
            }
        }
    }

    pub(crate) fn mark_preempted(&self, id: TaskId) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.status = TaskStatus::Preempted;
        }
    }

    pub(crate) fn mark_terminal(&self, id: TaskId, status: TaskStatus, error: Option<String>) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.status = status;
            entry.completed_at = Some(Utc::now());
            entry.error = error;
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn all(&self) -> std::collections::HashMap<TaskId, TaskInfo> {
        self.tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
