//! Executor: submission, result delivery, and lifecycle.
//!
//! The executor is the crate's public entry point.  It validates the pool
//! shape, mints one opaque resource per worker, spawns the dispatch loops
//! onto the ambient tokio runtime, and hands out [`TaskHandle`]s that resolve
//! to each task's terminal outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! # use companion_scheduler::{compute_fn, Executor, Priority, SchedulerConfig, Task};
//! # use futures::FutureExt;
//! # use tokio_util::sync::CancellationToken;
//! # async fn example() -> companion_scheduler::Result<()> {
//! let executor = Executor::new(SchedulerConfig::default())?;
//!
//! let task = Task::new(
//!     "greet",
//!     Priority::Ui,
//!     compute_fn(|_ctx| async move { Ok(serde_json::json!("hello")) }.boxed()),
//! );
//! let handle = executor.submit(task, CancellationToken::new()).await?;
//! let value = handle.outcome().await?;
//! assert_eq!(value, serde_json::json!("hello"));
//!
//! executor.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SchedulerConfig, WorkerClass};
use crate::dispatcher;
use crate::error::{Result, SchedulerError};
use crate::queue::{PushOutcome, QueueSet, TaskRequest};
use crate::state::NoState;
use crate::task::{StatusBoard, Task, TaskId, TaskInfo, TaskStatus, TaskValue};
use crate::worker::Worker;

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Caller-side handle to one submitted task.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<TaskValue>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// The task's unique identifier, usable with [`Executor::status`].
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task's terminal outcome.
    ///
    /// A preempted task has not terminated; this keeps waiting until it
    /// completes on a later run, is cancelled, or is drained by shutdown.
    /// The wait itself is unblocked early by the submission's cancellation
    /// handle, in which case `Cancelled` is returned.
    pub async fn outcome(mut self) -> Result<TaskValue> {
        tokio::select! {
            biased;
            delivered = &mut self.rx => match delivered {
                Ok(result) => result,
                // The sink only disappears unwritten when the request was
                // abandoned before a worker could observe it.
                Err(_) => Err(SchedulerError::Cancelled),
            },
            _ = self.cancel.cancelled() => Err(SchedulerError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Priority-preemptive task executor.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across threads and
/// async tasks.  Must be created from within a tokio runtime.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    queues: Arc<QueueSet>,
    board: StatusBoard,
    /// Wakes blocked submitters and idle workers at shutdown.
    shutdown: CancellationToken,
    /// When `false` the executor will not accept new work.
    accepting: AtomicBool,
    /// Resolves once every dispatch loop has exited.  Clonable, so every
    /// concurrent `shutdown` caller awaits the same completion.
    workers_done: Shared<BoxFuture<'static, ()>>,
}

impl Executor {
    /// Validate the configuration, mint per-worker resources, and start the
    /// worker pool.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let queues = Arc::new(QueueSet::new(&config));
        let board = StatusBoard::default();
        let shutdown = CancellationToken::new();
        let mut loops = Vec::with_capacity(config.total_workers());

        if config.single_worker() {
            let class = config.single_worker_class();
            let resource = (config.resource_factory)(0, class);
            let worker = Arc::new(Worker::new(0, class, resource, board.clone()));
            loops.push(tokio::spawn(dispatcher::run_single_worker(
                worker,
                Arc::clone(&queues),
                shutdown.clone(),
            )));
        } else {
            let mut worker_id = 0;
            for _ in 0..config.ui_workers {
                let resource = (config.resource_factory)(worker_id, WorkerClass::Ui);
                let worker = Arc::new(Worker::new(worker_id, WorkerClass::Ui, resource, board.clone()));
                loops.push(tokio::spawn(dispatcher::run_ui_worker(
                    worker,
                    Arc::clone(&queues),
                    shutdown.clone(),
                )));
                worker_id += 1;
            }
            for _ in 0..config.background_workers {
                let resource = (config.resource_factory)(worker_id, WorkerClass::Background);
                let worker = Arc::new(Worker::new(
                    worker_id,
                    WorkerClass::Background,
                    resource,
                    board.clone(),
                ));
                loops.push(tokio::spawn(dispatcher::run_background_worker(
                    worker,
                    Arc::clone(&queues),
                    shutdown.clone(),
                )));
                worker_id += 1;
            }
        }

        tracing::info!(
            event = "executor_started",
            ui_workers = config.ui_workers,
            background_workers = config.background_workers,
            "executor started"
        );

        let workers_done = futures::future::join_all(loops)
            .map(|_| ())
            .boxed()
            .shared();

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                queues,
                board,
                shutdown,
                accepting: AtomicBool::new(true),
                workers_done,
            }),
        })
    }

    /// Submit a task, waiting if its priority queue is full.  The wait is
    /// unblocked by the cancellation handle and by shutdown; in both cases
    /// the request never reaches a worker.
    pub async fn submit(&self, task: Task, cancel: CancellationToken) -> Result<TaskHandle> {
        let (req, handle) = self.admit(task, cancel)?;
        match self.inner.queues.push(req, &self.inner.shutdown).await {
            PushOutcome::Enqueued => Ok(handle),
            PushOutcome::Cancelled => {
                self.inner
                    .board
                    .mark_terminal(handle.id, TaskStatus::Cancelled, None);
                Err(SchedulerError::Cancelled)
            }
            PushOutcome::ShutdownRejected => {
                self.inner.board.mark_terminal(
                    handle.id,
                    TaskStatus::Failed,
                    Some(SchedulerError::ShutdownRejected.to_string()),
                );
                Err(SchedulerError::ShutdownRejected)
            }
        }
    }

    /// Non-blocking submission variant; fails with
    /// [`SchedulerError::QueueFull`] instead of waiting.
    pub fn try_submit(&self, task: Task, cancel: CancellationToken) -> Result<TaskHandle> {
        let (req, handle) = self.admit(task, cancel)?;
        match self.inner.queues.try_push(req) {
            Ok(()) => Ok(handle),
            Err(err) => {
                self.inner.board.remove(handle.id);
                Err(err)
            }
        }
    }

    /// Query the current status snapshot of a task.
    pub fn status(&self, id: TaskId) -> Option<TaskInfo> {
        self.inner.board.get(id)
    }

    /// Snapshot of all known tasks keyed by their ID.
    pub fn all_tasks(&self) -> HashMap<TaskId, TaskInfo> {
        self.inner.board.all()
    }

    /// Stop accepting work, let in-flight requests finish, and fail every
    /// still-queued request with `ShutdownRejected`.  Idempotent; returns
    /// once all workers have exited and the queues are drained.
    pub async fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!(event = "executor_shutdown", "shutdown requested");
        }
        self.inner.shutdown.cancel();

        // Every caller awaits the same completion, so a second concurrent
        // shutdown also returns only after all workers have exited.
        self.inner.workers_done.clone().await;

        self.inner.queues.drain(&self.inner.board);
    }

    /// Shared admission path: fail fast, register the task, and build the
    /// request/handle pair.
    fn admit(&self, task: Task, cancel: CancellationToken) -> Result<(TaskRequest, TaskHandle)> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutdownRejected);
        }
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let id = Uuid::now_v7();
        self.inner.board.insert(id, &task.name, task.priority);
        tracing::debug!(
            event = "task_submitted",
            task_name = %task.name,
            priority = ?task.priority,
            "task submitted"
        );

        let (sink, rx) = oneshot::channel();
        let req = TaskRequest {
            id,
            name: task.name,
            priority: task.priority,
            min_duration: task.min_duration,
            compute: task.compute,
            state: task.initial_state.unwrap_or_else(|| Box::new(NoState)),
            checkpoint: None,
            no_reschedule: Arc::new(AtomicBool::new(false)),
            cancel: cancel.clone(),
            sink,
        };
        Ok((req, TaskHandle { id, rx, cancel }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
