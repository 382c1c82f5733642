//! Integration tests for the companion-scheduler crate.
//!
//! These exercise the executor end to end: completion and failure delivery,
//! preemption with checkpointed resume in the single-worker configuration,
//! cancellation before and during execution, and shutdown draining.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use companion_scheduler::{
    Executor, Priority, SchedulerConfig, SchedulerError, StateCapability, Task, TaskStatus,
    compute_fn,
};

fn single_worker_config() -> SchedulerConfig {
    SchedulerConfig {
        ui_workers: 1,
        background_workers: 0,
        ..Default::default()
    }
}

/// A task that resolves to a fixed value and notes its run in `order`.
fn recording_task(
    name: &str,
    priority: Priority,
    order: &Arc<Mutex<Vec<String>>>,
) -> Task {
    let marker = name.to_string();
    let order = Arc::clone(order);
    Task::new(
        name,
        priority,
        compute_fn(move |_ctx| {
            let order = Arc::clone(&order);
            let marker = marker.clone();
            async move {
                order.lock().unwrap().push(marker.clone());
                Ok(json!(marker))
            }
            .boxed()
        }),
    )
}

// ═══════════════════════════════════════════════════════════════════════
//  Completion and delivery
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn background_task_completes_on_a_partitioned_pool() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();

    let task = Task::new(
        "a",
        Priority::Background,
        compute_fn(|_ctx| async move { Ok(json!("ok")) }.boxed()),
    );
    let handle = executor.submit(task, CancellationToken::new()).await.unwrap();
    assert_eq!(handle.outcome().await.unwrap(), json!("ok"));

    executor.shutdown().await;
}

#[tokio::test]
async fn compute_error_surfaces_verbatim() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();

    let task = Task::new(
        "boom",
        Priority::Critical,
        compute_fn(|_ctx| async move { Err(anyhow!("boom")) }.boxed()),
    );
    let handle = executor.submit(task, CancellationToken::new()).await.unwrap();
    let id = handle.id();

    match handle.outcome().await {
        Err(SchedulerError::Compute(err)) => assert_eq!(err.to_string(), "boom"),
        other => panic!("expected a compute error, got {other:?}"),
    }
    assert_eq!(executor.status(id).unwrap().status, TaskStatus::Failed);

    executor.shutdown().await;
}

#[tokio::test]
async fn enqueue_order_within_a_class_is_preserved() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..5 {
        let task = recording_task(&format!("bg-{i}"), Priority::Background, &order);
        handles.push(executor.submit(task, CancellationToken::new()).await.unwrap());
    }
    for handle in handles {
        handle.outcome().await.unwrap();
    }

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, ["bg-0", "bg-1", "bg-2", "bg-3", "bg-4"]);

    executor.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Single-worker preemption
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn interactive_arrival_preempts_running_background() {
    let executor = Executor::new(single_worker_config()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_probe = Arc::clone(&order);
    let background = Task::new(
        "cooperative-loop",
        Priority::Background,
        compute_fn(move |ctx| {
            let order = Arc::clone(&order_probe);
            let signal = ctx.signal.clone();
            async move {
                order.lock().unwrap().push("background-start".to_string());
                for i in 0..60 {
                    if signal.is_set() {
                        return Err(anyhow!("interrupted@{i}"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
                Ok(json!("background-done"))
            }
            .boxed()
        }),
    );
    let background_handle = executor
        .submit(background, CancellationToken::new())
        .await
        .unwrap();

    sleep(Duration::from_millis(30)).await;

    let ui_handle = executor
        .submit(
            recording_task("ui-run", Priority::Ui, &order),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The interactive task lands within the background's next poll interval.
    let ui_value = timeout(Duration::from_secs(1), ui_handle.outcome())
        .await
        .expect("ui task must not wait for the background to finish")
        .unwrap();
    assert_eq!(ui_value, json!("ui-run"));

    // The preempted background resumes from the stack and finishes cleanly.
    let background_value = timeout(Duration::from_secs(5), background_handle.outcome())
        .await
        .expect("background must resume after preemption")
        .unwrap();
    assert_eq!(background_value, json!("background-done"));

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, ["background-start", "ui-run", "background-start"]);

    executor.shutdown().await;
}

#[tokio::test]
async fn critical_arrival_preempts_like_ui() {
    let executor = Executor::new(single_worker_config()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_probe = Arc::clone(&order);
    let background = Task::new(
        "preemptible",
        Priority::Background,
        compute_fn(move |ctx| {
            let order = Arc::clone(&order_probe);
            let signal = ctx.signal.clone();
            async move {
                order.lock().unwrap().push("background-start".to_string());
                for _ in 0..40 {
                    if signal.is_set() {
                        return Err(anyhow!("interrupted"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
                Ok(json!("background-done"))
            }
            .boxed()
        }),
    );
    let background_handle = executor
        .submit(background, CancellationToken::new())
        .await
        .unwrap();

    sleep(Duration::from_millis(25)).await;

    let critical_handle = executor
        .submit(
            recording_task("critical-run", Priority::Critical, &order),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let value = timeout(Duration::from_secs(1), critical_handle.outcome())
        .await
        .expect("critical task must preempt the background")
        .unwrap();
    assert_eq!(value, json!("critical-run"));

    timeout(Duration::from_secs(5), background_handle.outcome())
        .await
        .expect("background must resume")
        .unwrap();

    executor.shutdown().await;
}

#[tokio::test]
async fn single_worker_drains_classes_in_strict_priority_order() {
    let executor = Executor::new(single_worker_config()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the worker with a non-cooperative background task; the queued
    // work behind it must then drain Ui before Critical before Background.
    let order_probe = Arc::clone(&order);
    let blocker = Task::new(
        "blocker",
        Priority::Background,
        compute_fn(move |_ctx| {
            let order = Arc::clone(&order_probe);
            async move {
                order.lock().unwrap().push("blocker".to_string());
                sleep(Duration::from_millis(50)).await;
                Ok(json!("blocker"))
            }
            .boxed()
        }),
    );
    let blocker_handle = executor.submit(blocker, CancellationToken::new()).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let late_background = executor
        .submit(
            recording_task("background", Priority::Background, &order),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let ui = executor
        .submit(
            recording_task("ui", Priority::Ui, &order),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let critical = executor
        .submit(
            recording_task("critical", Priority::Critical, &order),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    for handle in [late_background, critical, ui] {
        timeout(Duration::from_secs(2), handle.outcome())
            .await
            .expect("queued work must drain")
            .unwrap();
    }
    // The blocker ignored its interrupt and returned a value, which is a
    // normal completion even though the dispatcher asked it to stop.
    assert_eq!(blocker_handle.outcome().await.unwrap(), json!("blocker"));

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, ["blocker", "ui", "critical", "background"]);

    executor.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Checkpointed resume
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct CounterState {
    counter: u32,
    msg: String,
}

impl StateCapability for CounterState {
    fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("counter state serialises")
    }

    fn deserialize(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        *self = serde_json::from_slice(bytes)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[tokio::test]
async fn preempted_stateful_task_resumes_from_its_checkpoint() {
    let executor = Executor::new(single_worker_config()).unwrap();

    let stateful = Task {
        name: "counted".into(),
        priority: Priority::Background,
        min_duration: Duration::ZERO,
        compute: compute_fn(|ctx| {
            async move {
                let signal = ctx.signal.clone();
                let control = ctx.control.clone();
                let state = ctx
                    .state_mut::<CounterState>()
                    .ok_or_else(|| anyhow!("unexpected state type"))?;
                let mut i = state.counter;
                while i < 10 {
                    if signal.is_set() {
                        state.counter = i;
                        state.msg = format!("p@{i}");
                        control.save(Some(&*state))?;
                        return Err(anyhow!("stopping at {i}"));
                    }
                    sleep(Duration::from_millis(20)).await;
                    i += 1;
                    state.counter = i;
                }
                Ok(json!(format!("done:{}", state.counter)))
            }
            .boxed()
        }),
        initial_state: Some(Box::new(CounterState {
            counter: 0,
            msg: "init".into(),
        })),
    };
    let handle = executor.submit(stateful, CancellationToken::new()).await.unwrap();
    let id = handle.id();

    // Force one preemption partway through the count.
    sleep(Duration::from_millis(30)).await;
    executor
        .submit(
            Task::new(
                "nudge",
                Priority::Ui,
                compute_fn(|_ctx| async move { Ok(json!("ui")) }.boxed()),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let value = timeout(Duration::from_secs(5), handle.outcome())
        .await
        .expect("stateful task must finish after resume")
        .unwrap();
    assert_eq!(value, json!("done:10"));

    let info = executor.status(id).unwrap();
    assert_eq!(info.status, TaskStatus::Completed);
    assert!(info.attempts >= 2, "expected at least one resume");

    executor.shutdown().await;
}

/// Restoring must only happen when a checkpoint was actually saved.
struct RefusesRestore;

impl StateCapability for RefusesRestore {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
        Err(anyhow!("restore attempted without a checkpoint"))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[tokio::test]
async fn reschedule_without_save_restarts_from_initial_state() {
    let executor = Executor::new(single_worker_config()).unwrap();

    let interrupted_once = Arc::new(AtomicBool::new(false));
    let probe = Arc::clone(&interrupted_once);
    let background = Task {
        name: "no-save".into(),
        priority: Priority::Background,
        min_duration: Duration::ZERO,
        compute: compute_fn(move |ctx| {
            let first_attempt = !probe.swap(true, Ordering::SeqCst);
            let signal = ctx.signal.clone();
            async move {
                if !first_attempt {
                    return Ok(json!("resumed"));
                }
                loop {
                    if signal.is_set() {
                        // Deliberately no save: the reschedule must not try
                        // to restore anything.
                        return Err(anyhow!("interrupted"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            }
            .boxed()
        }),
        initial_state: Some(Box::new(RefusesRestore)),
    };
    let handle = executor.submit(background, CancellationToken::new()).await.unwrap();

    sleep(Duration::from_millis(25)).await;
    executor
        .submit(
            Task::new(
                "nudge",
                Priority::Ui,
                compute_fn(|_ctx| async move { Ok(json!("ui")) }.boxed()),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let value = timeout(Duration::from_secs(2), handle.outcome())
        .await
        .expect("task must resume without a restore")
        .unwrap();
    assert_eq!(value, json!("resumed"));

    executor.shutdown().await;
}

#[tokio::test]
async fn corrupt_checkpoint_fails_terminally() {
    let executor = Executor::new(single_worker_config()).unwrap();

    struct Fragile;
    impl StateCapability for Fragile {
        fn serialize(&self) -> Vec<u8> {
            b"checkpoint".to_vec()
        }
        fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
            Err(anyhow!("bit rot"))
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    let background = Task {
        name: "fragile".into(),
        priority: Priority::Background,
        min_duration: Duration::ZERO,
        compute: compute_fn(|ctx| {
            let signal = ctx.signal.clone();
            let control = ctx.control.clone();
            async move {
                loop {
                    if signal.is_set() {
                        control.save(Some(&Fragile))?;
                        return Err(anyhow!("interrupted"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            }
            .boxed()
        }),
        initial_state: Some(Box::new(Fragile)),
    };
    let handle = executor.submit(background, CancellationToken::new()).await.unwrap();

    sleep(Duration::from_millis(25)).await;
    executor
        .submit(
            Task::new(
                "nudge",
                Priority::Ui,
                compute_fn(|_ctx| async move { Ok(json!("ui")) }.boxed()),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    match timeout(Duration::from_secs(2), handle.outcome()).await.unwrap() {
        Err(SchedulerError::StateRestoreFailed { reason }) => {
            assert!(reason.contains("bit rot"));
        }
        other => panic!("expected a restore failure, got {other:?}"),
    }

    executor.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Reschedule opt-out
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancel_reschedule_surfaces_the_interrupt_error_immediately() {
    let executor = Executor::new(single_worker_config()).unwrap();

    let background = Task::new(
        "one-shot",
        Priority::Background,
        compute_fn(|ctx| {
            let signal = ctx.signal.clone();
            let control = ctx.control.clone();
            async move {
                loop {
                    if signal.is_set() {
                        control.cancel_reschedule();
                        return Err(anyhow!("refused"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            }
            .boxed()
        }),
    );
    let handle = executor.submit(background, CancellationToken::new()).await.unwrap();
    let id = handle.id();

    sleep(Duration::from_millis(25)).await;
    executor
        .submit(
            Task::new(
                "nudge",
                Priority::Ui,
                compute_fn(|_ctx| async move { Ok(json!("ui")) }.boxed()),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    match timeout(Duration::from_secs(1), handle.outcome()).await.unwrap() {
        Err(SchedulerError::Compute(err)) => assert_eq!(err.to_string(), "refused"),
        other => panic!("expected the compute error verbatim, got {other:?}"),
    }

    let info = executor.status(id).unwrap();
    assert_eq!(info.status, TaskStatus::Failed);
    assert_eq!(info.attempts, 1, "an opted-out task must never be rescheduled");

    executor.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancellation_during_queue_wait_never_dispatches() {
    let config = SchedulerConfig {
        ui_workers: 0,
        background_workers: 1,
        queue_capacity_background: 0,
        ..Default::default()
    };
    let executor = Executor::new(config).unwrap();

    let long_running = Task::new(
        "occupant",
        Priority::Background,
        compute_fn(|_ctx| {
            async move {
                sleep(Duration::from_millis(150)).await;
                Ok(json!("occupant-done"))
            }
            .boxed()
        }),
    );
    let occupant = executor
        .submit(long_running, CancellationToken::new())
        .await
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_probe = Arc::clone(&ran);
    let starved = Task::new(
        "starved",
        Priority::Background,
        compute_fn(move |_ctx| {
            let ran = Arc::clone(&ran_probe);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(json!("never"))
            }
            .boxed()
        }),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    // With a rendezvous lane and a busy worker, the submission blocks until
    // the cancellation unblocks it.
    let result = executor.submit(starved, cancel).await;
    assert!(matches!(result, Err(SchedulerError::Cancelled)));
    assert!(!ran.load(Ordering::SeqCst), "a cancelled submission must never run");

    assert_eq!(occupant.outcome().await.unwrap(), json!("occupant-done"));
    executor.shutdown().await;
}

#[tokio::test]
async fn cancellation_mid_run_interrupts_and_never_reschedules() {
    let executor = Executor::new(single_worker_config()).unwrap();

    let background = Task::new(
        "doomed",
        Priority::Background,
        compute_fn(|ctx| {
            let signal = ctx.signal.clone();
            async move {
                loop {
                    if signal.is_set() {
                        return Err(anyhow!("winding down"));
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            }
            .boxed()
        }),
    );
    let cancel = CancellationToken::new();
    let handle = executor.submit(background, cancel.clone()).await.unwrap();
    let id = handle.id();

    sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let result = timeout(Duration::from_secs(1), handle.outcome())
        .await
        .expect("cancellation must release the awaiter");
    assert!(matches!(result, Err(SchedulerError::Cancelled)));

    // Give the worker a beat to settle the terminal status.
    sleep(Duration::from_millis(50)).await;
    let info = executor.status(id).unwrap();
    assert_eq!(info.status, TaskStatus::Cancelled);
    assert_eq!(info.attempts, 1);

    executor.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shutdown_completes_in_flight_work_and_drains_the_rest() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        let task = Task {
            name: format!("slow-{i}"),
            priority: Priority::Background,
            min_duration: Duration::from_millis(100),
            compute: compute_fn(|_ctx| async move { Ok(json!("done")) }.boxed()),
            initial_state: None,
        };
        handles.push(executor.submit(task, CancellationToken::new()).await.unwrap());
    }

    sleep(Duration::from_millis(50)).await;
    executor.shutdown().await;

    let mut completed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.outcome().await {
            Ok(value) => {
                assert_eq!(value, json!("done"));
                completed += 1;
            }
            Err(SchedulerError::ShutdownRejected) => rejected += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    // One task was in flight on the lone background worker; the rest were
    // still queued.
    assert_eq!(completed, 1);
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();
    executor.shutdown().await;
    executor.shutdown().await;
}

#[tokio::test]
async fn concurrent_shutdown_callers_all_wait_for_workers() {
    let executor = Executor::new(SchedulerConfig::default()).unwrap();

    let task = Task {
        name: "in-flight".into(),
        priority: Priority::Background,
        min_duration: Duration::from_millis(100),
        compute: compute_fn(|_ctx| async move { Ok(json!("done")) }.boxed()),
        initial_state: None,
    };
    let handle = executor.submit(task, CancellationToken::new()).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    let mut callers = Vec::new();
    for _ in 0..2 {
        let executor = executor.clone();
        callers.push(tokio::spawn(async move {
            let started = Instant::now();
            executor.shutdown().await;
            started.elapsed()
        }));
    }
    for caller in callers {
        let waited = caller.await.unwrap();
        assert!(
            waited >= Duration::from_millis(50),
            "every shutdown caller must wait for the in-flight task, waited {waited:?}"
        );
    }

    assert_eq!(handle.outcome().await.unwrap(), json!("done"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Non-blocking submission
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn try_submit_reports_a_full_lane() {
    let config = SchedulerConfig {
        ui_workers: 1,
        background_workers: 0,
        queue_capacity_background: 0,
        ..Default::default()
    };
    let executor = Executor::new(config).unwrap();

    // Occupy the lone worker so nothing is waiting on the background lane.
    let busy = executor
        .submit(
            Task::new(
                "busy",
                Priority::Ui,
                compute_fn(|_ctx| {
                    async move {
                        sleep(Duration::from_millis(100)).await;
                        Ok(json!("busy-done"))
                    }
                    .boxed()
                }),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    let result = executor.try_submit(
        Task::new(
            "overflow",
            Priority::Background,
            compute_fn(|_ctx| async move { Ok(json!("never")) }.boxed()),
        ),
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(SchedulerError::QueueFull)));

    busy.outcome().await.unwrap();
    executor.shutdown().await;
}
