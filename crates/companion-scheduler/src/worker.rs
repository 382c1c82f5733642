//! Worker state machine.
//!
//! A worker owns one opaque resource and runs one request at a time:
//!
//! ```text
//! idle --> binding (restore state) --> running --> draining --> idle
//! ```
//!
//! The compute callable runs on a child tokio task while the worker races its
//! completion against the submitter's cancellation handle and the worker's
//! interrupt signal.  Cancellation always terminates the request; an
//! interrupt leads to a [`ProcessOutcome::Preempted`] hand-back when the
//! compute drained with an error and did not opt out of rescheduling.
//!
//! The interrupt channel is single-slot and coalescing: any number of
//! [`Worker::interrupt`] calls before the worker drains count as one, and a
//! stale signal left over from a previous request is dropped when the next
//! invocation arms a fresh one.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::config::{WorkerClass, WorkerResource};
use crate::error::SchedulerError;
use crate::interrupt::{InterruptControl, InterruptSignal};
use crate::queue::TaskRequest;
use crate::state::NoState;
use crate::task::{ComputeResult, StatusBoard, TaskContext};

/// How long a cancelled compute gets to notice its interrupt signal and
/// return before the child task is torn down.
const CANCEL_DRAIN: Duration = Duration::from_millis(250);

/// What became of a request handed to [`Worker::process`].
pub(crate) enum ProcessOutcome {
    /// The request terminated; its result sink has been written.
    Delivered,
    /// The request was preempted mid-run and is handed back for reschedule,
    /// carrying its latest checkpoint.
    Preempted(TaskRequest),
}

/// A single-request executor bound to one opaque resource.
pub(crate) struct Worker {
    id: usize,
    class: WorkerClass,
    resource: WorkerResource,
    board: StatusBoard,
    /// Interrupt signal of the invocation currently running, if any.
    current_signal: Mutex<Option<InterruptSignal>>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        class: WorkerClass,
        resource: WorkerResource,
        board: StatusBoard,
    ) -> Self {
        tracing::debug!(event = "worker_started", worker_id = id, class = ?class, "worker created");
        Self {
            id,
            class,
            resource,
            board,
            current_signal: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn class(&self) -> WorkerClass {
        self.class
    }

    /// Fire the interrupt signal of the invocation currently running.
    /// Non-blocking; a no-op when the worker is idle.
    pub(crate) fn interrupt(&self) {
        if let Some(signal) = self.lock_signal().as_ref() {
            signal.set();
        }
    }

    /// Run one request to a terminal outcome or a preemption hand-back.
    pub(crate) async fn process(&self, mut req: TaskRequest) -> ProcessOutcome {
        let started = Instant::now();

        // A cancellation that already fired wins without touching compute.
        if req.cancel.is_cancelled() {
            tracing::debug!(
                event = "task_cancelled",
                worker_id = self.id,
                task_name = %req.name,
                "cancelled before binding"
            );
            req.deliver(Err(SchedulerError::Cancelled), &self.board);
            return ProcessOutcome::Delivered;
        }

        // Arm a fresh signal for this invocation; a stale one is dropped here.
        let signal = InterruptSignal::new();
        *self.lock_signal() = Some(signal.clone());
        let cancel = req.cancel.clone();

        self.board.mark_running(req.id);
        tracing::info!(
            event = "task_running",
            worker_id = self.id,
            task_name = %req.name,
            priority = ?req.priority,
            resumed = req.checkpoint.is_some(),
            "task running"
        );

        // Honour the minimum duration, but let cancellation and interrupts
        // cut it short.
        if !req.min_duration.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.disarm();
                    req.deliver(Err(SchedulerError::Cancelled), &self.board);
                    return ProcessOutcome::Delivered;
                }
                _ = signal.fired() => {
                    self.disarm();
                    // Compute never ran: no new checkpoint, any prior one is kept.
                    self.board.mark_preempted(req.id);
                    return ProcessOutcome::Preempted(req);
                }
                _ = tokio::time::sleep(req.min_duration) => {}
            }
        }

        // Restore the latest checkpoint into the task's state.
        if let Some(blob) = &req.checkpoint {
            if let Err(err) = req.state.deserialize(blob) {
                self.disarm();
                tracing::error!(
                    event = "task_failed",
                    worker_id = self.id,
                    task_name = %req.name,
                    error = %err,
                    "checkpoint restore failed"
                );
                let reason = err.to_string();
                req.deliver(Err(SchedulerError::StateRestoreFailed { reason }), &self.board);
                return ProcessOutcome::Delivered;
            }
        }

        // Run compute on a child task so the worker can keep watching the
        // cancellation handle and the interrupt signal.
        let control = InterruptControl::new(signal.clone(), Arc::clone(&req.no_reschedule));
        let mut ctx = TaskContext {
            resource: Arc::clone(&self.resource),
            state: mem::replace(&mut req.state, Box::new(NoState)),
            control: control.clone(),
            signal: signal.clone(),
        };
        let compute = Arc::clone(&req.compute);
        let mut child = tokio::spawn(async move {
            let output = (compute)(&mut ctx).await;
            (output, ctx)
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Nudge a cooperative compute, then drain within a bound.  A
                // cancelled request is never rescheduled, so any checkpoint it
                // saved is discarded along with `control`.
                signal.set();
                match timeout(CANCEL_DRAIN, &mut child).await {
                    Ok(Ok((_, ctx))) => req.state = ctx.state,
                    Ok(Err(join_err)) => {
                        tracing::warn!(
                            event = "compute_panicked",
                            worker_id = self.id,
                            task_name = %req.name,
                            error = %join_err,
                            "compute failed while draining under cancellation"
                        );
                    }
                    Err(_) => {
                        child.abort();
                        tracing::warn!(
                            event = "compute_abandoned",
                            worker_id = self.id,
                            task_name = %req.name,
                            "compute exceeded the cancellation drain bound"
                        );
                    }
                }
                tracing::info!(
                    event = "task_cancelled",
                    worker_id = self.id,
                    task_name = %req.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task cancelled mid-run"
                );
                req.deliver(Err(SchedulerError::Cancelled), &self.board);
                ProcessOutcome::Delivered
            }
            _ = signal.fired() => {
                // Dispatcher preemption: wait for compute to drain on its own.
                match (&mut child).await {
                    Ok((output, ctx)) => {
                        req.state = ctx.state;
                        self.classify_interrupted(req, output, &control, started)
                    }
                    Err(join_err) => {
                        let err = anyhow::anyhow!("compute task failed: {join_err}");
                        req.deliver(Err(SchedulerError::Compute(err)), &self.board);
                        ProcessOutcome::Delivered
                    }
                }
            }
            joined = &mut child => {
                match joined {
                    Ok((output, ctx)) => {
                        req.state = ctx.state;
                        self.finish(req, output, started)
                    }
                    Err(join_err) => {
                        tracing::error!(
                            event = "compute_panicked",
                            worker_id = self.id,
                            task_name = %req.name,
                            error = %join_err,
                            "compute task failed"
                        );
                        let err = anyhow::anyhow!("compute task failed: {join_err}");
                        req.deliver(Err(SchedulerError::Compute(err)), &self.board);
                        ProcessOutcome::Delivered
                    }
                }
            }
        };
        self.disarm();
        outcome
    }

    /// Compute returned with no interrupt in play: a plain completion or
    /// failure.  Any checkpoint it saved along the way is discarded.
    fn finish(&self, req: TaskRequest, output: ComputeResult, started: Instant) -> ProcessOutcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match output {
            Ok(value) => {
                tracing::info!(
                    event = "task_completed",
                    worker_id = self.id,
                    task_name = %req.name,
                    elapsed_ms,
                    "task completed"
                );
                req.deliver(Ok(value), &self.board);
            }
            Err(err) => {
                tracing::error!(
                    event = "task_failed",
                    worker_id = self.id,
                    task_name = %req.name,
                    elapsed_ms,
                    error = %err,
                    "task failed"
                );
                req.deliver(Err(SchedulerError::Compute(err)), &self.board);
            }
        }
        ProcessOutcome::Delivered
    }

    /// Compute drained after an interrupt.  A success, or any return with the
    /// no-reschedule flag set, is delivered verbatim; an error from a
    /// reschedulable request is an effective preemption.
    fn classify_interrupted(
        &self,
        mut req: TaskRequest,
        output: ComputeResult,
        control: &InterruptControl,
        started: Instant,
    ) -> ProcessOutcome {
        let no_reschedule = req.no_reschedule.load(Ordering::Acquire);
        match output {
            Err(_) if !no_reschedule => {
                if let Some(bytes) = control.take_checkpoint() {
                    req.checkpoint = Some(bytes);
                }
                self.board.mark_preempted(req.id);
                tracing::info!(
                    event = "task_preempted",
                    worker_id = self.id,
                    task_name = %req.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    state_bytes = req.checkpoint.as_ref().map_or(0, Vec::len),
                    "task preempted"
                );
                ProcessOutcome::Preempted(req)
            }
            other => self.finish(req, other, started),
        }
    }

    fn disarm(&self) {
        *self.lock_signal() = None;
    }

    fn lock_signal(&self) -> std::sync::MutexGuard<'_, Option<InterruptSignal>> {
        self.current_signal.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
