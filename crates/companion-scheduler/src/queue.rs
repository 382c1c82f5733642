//! Priority queue set and reschedule stack.
//!
//! Three bounded FIFO lanes (Ui, Critical, Background) hold submitted
//! requests; a LIFO stack holds Background requests that were preempted
//! mid-run, together with their latest checkpoint.  The stack is LIFO so the
//! most recently interrupted work resumes first, preserving locality.
//!
//! Lanes are [`flume`] bounded channels: enqueueing applies back-pressure,
//! capacity zero degenerates to a synchronous rendezvous, and receivers are
//! cheap to clone so several workers can drain one lane.  An enqueue blocked
//! on a full lane is unblocked by the submitter's cancellation handle or by
//! executor shutdown.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::state::StateCapability;
use crate::task::{ComputeFn, Priority, StatusBoard, TaskId, TaskStatus, TaskValue};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A submitted task plus everything the scheduler needs to run, preempt,
/// resume, and answer it.
pub(crate) struct TaskRequest {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub min_duration: Duration,
    pub compute: ComputeFn,
    /// The task's state object; restored from `checkpoint` before each run.
    pub state: Box<dyn StateCapability>,
    /// Bytes of the most recent successful checkpoint, if any run saved one.
    pub checkpoint: Option<Vec<u8>>,
    /// Sticky opt-out from rescheduling, set by compute via
    /// [`InterruptControl::cancel_reschedule`](crate::InterruptControl::cancel_reschedule).
    pub no_reschedule: Arc<AtomicBool>,
    /// The submitter's cancellation handle.
    pub cancel: CancellationToken,
    /// Single-use result delivery channel.
    pub sink: oneshot::Sender<Result<TaskValue>>,
}

impl TaskRequest {
    /// Terminate the request: record the terminal status and write the result
    /// sink exactly once.  The send result is deliberately ignored; a caller
    /// that dropped its handle no longer cares.
    pub(crate) fn deliver(self, result: Result<TaskValue>, board: &StatusBoard) {
        let (status, error) = match &result {
            Ok(_) => (TaskStatus::Completed, None),
            Err(SchedulerError::Cancelled) => (TaskStatus::Cancelled, None),
            Err(err) => (TaskStatus::Failed, Some(err.to_string())),
        };
        board.mark_terminal(self.id, status, error);
        let _ = self.sink.send(result);
    }
}

/// Outcome of a (blocking) enqueue attempt.
pub(crate) enum PushOutcome {
    Enqueued,
    Cancelled,
    ShutdownRejected,
}

// ---------------------------------------------------------------------------
// Queue set
// ---------------------------------------------------------------------------

/// The three priority lanes plus the reschedule stack.
pub(crate) struct QueueSet {
    ui_tx: flume::Sender<TaskRequest>,
    critical_tx: flume::Sender<TaskRequest>,
    background_tx: flume::Sender<TaskRequest>,
    pub(crate) ui_rx: flume::Receiver<TaskRequest>,
    pub(crate) critical_rx: flume::Receiver<TaskRequest>,
    pub(crate) background_rx: flume::Receiver<TaskRequest>,
    /// LIFO stack of preempted Background requests.
    resched: Mutex<Vec<TaskRequest>>,
}

impl QueueSet {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        let (ui_tx, ui_rx) = flume::bounded(config.queue_capacity_ui);
        let (critical_tx, critical_rx) = flume::bounded(config.queue_capacity_critical);
        let (background_tx, background_rx) = flume::bounded(config.queue_capacity_background);
        Self {
            ui_tx,
            critical_tx,
            background_tx,
            ui_rx,
            critical_rx,
            background_rx,
            resched: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self, priority: Priority) -> &flume::Sender<TaskRequest> {
        match priority {
            Priority::Ui => &self.ui_tx,
            Priority::Critical => &self.critical_tx,
            Priority::Background => &self.background_tx,
        }
    }

    /// Enqueue a request, waiting under back-pressure.  The wait is unblocked
    /// by the submitter's cancellation handle and by executor shutdown; in
    /// both cases the request never reaches a lane and no worker ever
    /// observes it.
    pub(crate) async fn push(
        &self,
        req: TaskRequest,
        shutdown: &CancellationToken,
    ) -> PushOutcome {
        let cancel = req.cancel.clone();
        let tx = self.sender(req.priority);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PushOutcome::Cancelled,
            _ = shutdown.cancelled() => PushOutcome::ShutdownRejected,
            sent = tx.send_async(req) => match sent {
                Ok(()) => PushOutcome::Enqueued,
                // Receivers only disappear during teardown.
                Err(_) => PushOutcome::ShutdownRejected,
            },
        }
    }

    /// Non-blocking enqueue for `try_submit`.
    pub(crate) fn try_push(&self, req: TaskRequest) -> Result<()> {
        match self.sender(req.priority).try_send(req) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(SchedulerError::QueueFull),
            Err(flume::TrySendError::Disconnected(_)) => Err(SchedulerError::ShutdownRejected),
        }
    }

    /// Park a preempted Background request for a later resume.
    pub(crate) fn push_resched(&self, req: TaskRequest) {
        tracing::debug!(
            event = "task_rescheduled",
            task_name = %req.name,
            state_bytes = req.checkpoint.as_ref().map_or(0, Vec::len),
            "preempted task parked for resume"
        );
        self.lock_resched().push(req);
    }

    /// Next Background candidate: the reschedule stack first (LIFO), then the
    /// Background lane (FIFO).
    pub(crate) fn next_background(&self) -> Option<TaskRequest> {
        if let Some(req) = self.lock_resched().pop() {
            return Some(req);
        }
        self.background_rx.try_recv().ok()
    }

    /// Drain everything still queued after the workers have exited, failing
    /// each request with `ShutdownRejected`.
    pub(crate) fn drain(&self, board: &StatusBoard) {
        let mut drained = 0usize;
        let parked = std::mem::take(&mut *self.lock_resched());
        for req in parked {
            req.deliver(Err(SchedulerError::ShutdownRejected), board);
            drained += 1;
        }
        for rx in [&self.ui_rx, &self.critical_rx, &self.background_rx] {
            while let Ok(req) = rx.try_recv() {
                req.deliver(Err(SchedulerError::ShutdownRejected), board);
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::info!(event = "queues_drained", drained, "rejected queued tasks at shutdown");
        }
    }

    fn lock_resched(&self) -> std::sync::MutexGuard<'_, Vec<TaskRequest>> {
        self.resched.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
