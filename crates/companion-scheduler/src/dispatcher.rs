//! Dispatch loops.
//!
//! Two operating modes, selected by the pool shape:
//!
//! - **Multi-worker**: every worker has a fixed role.  UI workers drain the
//!   Ui and Critical lanes (Ui strictly preferred) and never touch
//!   Background work; Background workers drain the reschedule stack and the
//!   Background lane and never touch interactive work.  Priority is enforced
//!   purely by pool partitioning; nothing is ever preempted.
//! - **Single-worker**: one worker serves all three classes.  Ui and
//!   Critical run to completion uninterrupted; Background runs under
//!   supervision, and an interactive arrival interrupts it, parks it on the
//!   reschedule stack with its checkpoint, and takes over the worker.
//!
//! Each loop re-checks shutdown before claiming new work, so in-flight
//! requests always finish while queued ones are left for the shutdown drain.

use std::pin::pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::queue::{QueueSet, TaskRequest};
use crate::worker::{ProcessOutcome, Worker};

/// Loop for a dedicated UI-class worker: Ui strictly before Critical, never
/// Background.
pub(crate) async fn run_ui_worker(
    worker: Arc<Worker>,
    queues: Arc<QueueSet>,
    shutdown: CancellationToken,
) {
    tracing::debug!(
        event = "dispatcher_started",
        worker_id = worker.id(),
        class = ?worker.class(),
        "ui worker loop started"
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if let Ok(req) = queues.ui_rx.try_recv() {
            run_one(&worker, &queues, req).await;
            continue;
        }
        if let Ok(req) = queues.critical_rx.try_recv() {
            run_one(&worker, &queues, req).await;
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            recv = queues.ui_rx.recv_async() => {
                if let Ok(req) = recv {
                    run_one(&worker, &queues, req).await;
                }
            }
            recv = queues.critical_rx.recv_async() => {
                if let Ok(req) = recv {
                    run_one(&worker, &queues, req).await;
                }
            }
        }
    }
    tracing::debug!(event = "dispatcher_stopped", worker_id = worker.id(), "ui worker loop stopped");
}

/// Loop for a dedicated Background-class worker: reschedule stack first,
/// then the Background lane.
pub(crate) async fn run_background_worker(
    worker: Arc<Worker>,
    queues: Arc<QueueSet>,
    shutdown: CancellationToken,
) {
    tracing::debug!(
        event = "dispatcher_started",
        worker_id = worker.id(),
        class = ?worker.class(),
        "background worker loop started"
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if let Some(req) = queues.next_background() {
            run_one(&worker, &queues, req).await;
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            recv = queues.background_rx.recv_async() => {
                if let Ok(req) = recv {
                    run_one(&worker, &queues, req).await;
                }
            }
        }
    }
    tracing::debug!(event = "dispatcher_stopped", worker_id = worker.id(), "background worker loop stopped");
}

/// Loop for the lone worker serving all three classes, with cooperative
/// preemption of Background work.
pub(crate) async fn run_single_worker(
    worker: Arc<Worker>,
    queues: Arc<QueueSet>,
    shutdown: CancellationToken,
) {
    tracing::debug!(
        event = "dispatcher_started",
        worker_id = worker.id(),
        class = ?worker.class(),
        "single-worker loop started"
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if let Ok(req) = queues.ui_rx.try_recv() {
            run_one(&worker, &queues, req).await;
            continue;
        }
        if let Ok(req) = queues.critical_rx.try_recv() {
            run_one(&worker, &queues, req).await;
            continue;
        }
        if let Some(req) = queues.next_background() {
            supervise(&worker, &queues, req).await;
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            recv = queues.ui_rx.recv_async() => {
                if let Ok(req) = recv {
                    run_one(&worker, &queues, req).await;
                }
            }
            recv = queues.critical_rx.recv_async() => {
                if let Ok(req) = recv {
                    run_one(&worker, &queues, req).await;
                }
            }
            recv = queues.background_rx.recv_async() => {
                if let Ok(req) = recv {
                    supervise(&worker, &queues, req).await;
                }
            }
        }
    }
    tracing::debug!(event = "dispatcher_stopped", worker_id = worker.id(), "single-worker loop stopped");
}

/// Run one request to its outcome, parking it on the reschedule stack if the
/// worker hands it back preempted.
async fn run_one(worker: &Worker, queues: &QueueSet, req: TaskRequest) {
    settle(worker.process(req).await, queues);
}

/// Run a Background request while watching the interactive lanes.  Exactly
/// one of three things happens: the request settles on its own, its own
/// cancellation fires (the worker handles that internally), or an
/// interactive arrival preempts it.  Ui wins ties over Critical.
async fn supervise(worker: &Worker, queues: &QueueSet, req: TaskRequest) {
    let task_name = req.name.clone();
    let mut processing = pin!(worker.process(req));
    let arrival = tokio::select! {
        biased;
        outcome = &mut processing => {
            settle(outcome, queues);
            return;
        }
        recv = queues.ui_rx.recv_async() => recv.ok(),
        recv = queues.critical_rx.recv_async() => recv.ok(),
    };
    tracing::debug!(
        event = "preemption_requested",
        worker_id = worker.id(),
        task_name = %task_name,
        "interrupting background work for an interactive arrival"
    );
    worker.interrupt();
    // Wait for the background compute to drain, then give the worker to the
    // arrival.
    settle(processing.await, queues);
    if let Some(high) = arrival {
        run_one(worker, queues, high).await;
    }
}

fn settle(outcome: ProcessOutcome, queues: &QueueSet) {
    match outcome {
        ProcessOutcome::Delivered => {}
        ProcessOutcome::Preempted(req) => queues.push_resched(req),
    }
}
