//! Scheduler error types.
//!
//! All scheduler subsystems surface errors through [`SchedulerError`], which
//! is the single error type returned by every public API in this crate.  Each
//! variant carries enough context for callers to decide how to handle the
//! failure without inspecting opaque strings.

/// Unified error type for the Companion task-execution kernel.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    // -- Caller-driven outcomes ---------------------------------------------
    /// The submission's cancellation handle fired before or during execution.
    /// A cancelled task is never rescheduled.
    #[error("task cancelled")]
    Cancelled,

    /// The executor is or became shut down before the request terminated.
    #[error("executor is shut down")]
    ShutdownRejected,

    // -- Checkpoint / state errors ------------------------------------------
    /// Restoring a checkpoint into the task's state failed.  Terminal; the
    /// request is not rescheduled.
    #[error("state restore failed: {reason}")]
    StateRestoreFailed { reason: String },

    /// The compute function asked to checkpoint a nil state.  Returned
    /// synchronously from [`InterruptControl::save`](crate::InterruptControl::save);
    /// the task itself keeps running.
    #[error("cannot save nil state")]
    NilStateSave,

    // -- Compute errors -----------------------------------------------------
    /// The compute function returned an error unrelated to interruption or
    /// cancellation.  Surfaced verbatim to the caller.
    #[error("compute failed: {0}")]
    Compute(anyhow::Error),

    // -- Construction & submission errors -----------------------------------
    /// The worker-pool shape or buffer sizes are invalid.  Thrown by
    /// [`Executor::new`](crate::Executor::new) only.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The target priority queue is full.  Only surfaced by the non-blocking
    /// [`Executor::try_submit`](crate::Executor::try_submit); the default
    /// submission path blocks instead.
    #[error("priority queue is full")]
    QueueFull,
}

/// Convenience alias used throughout the scheduler crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;
