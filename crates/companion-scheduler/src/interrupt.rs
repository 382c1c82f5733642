//! Interrupt signalling between the dispatcher, a worker, and its compute.
//!
//! Preemption in this scheduler is cooperative: the dispatcher fires a
//! worker's interrupt, the worker latches it into the invocation's
//! [`InterruptSignal`], and the compute function is expected to poll (or
//! await) that signal at convenient points and return.  Nothing ever unwinds
//! a compute forcibly on preemption.
//!
//! The compute also receives an [`InterruptControl`], through which it can
//! checkpoint its state for a later resume and opt out of rescheduling
//! entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::state::StateCapability;

/// One-shot interruption notifier observable by a compute function.
///
/// The signal starts low and latches high when the dispatcher preempts (or
/// the caller cancels) the running task; once fired it stays set for the
/// remainder of the invocation.  Handles are cheap to clone and all observe
/// the same underlying signal.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    token: CancellationToken,
}

impl InterruptSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Non-blocking poll of the signal.
    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the signal fires.  Returns immediately if it already has.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }

    /// Latch the signal high.  Idempotent: repeated fires coalesce into one.
    pub(crate) fn set(&self) {
        self.token.cancel();
    }
}

/// Compute-facing control surface for checkpointing and reschedule policy.
///
/// Handed to every compute invocation alongside the raw [`InterruptSignal`].
/// Clones share the invocation's checkpoint slot and the request's
/// no-reschedule flag.
#[derive(Clone)]
pub struct InterruptControl {
    signal: InterruptSignal,
    /// Latest successful checkpoint of this invocation.
    saved: Arc<Mutex<Option<Vec<u8>>>>,
    /// Sticky across invocations of the same request.
    no_reschedule: Arc<AtomicBool>,
}

impl InterruptControl {
    pub(crate) fn new(signal: InterruptSignal, no_reschedule: Arc<AtomicBool>) -> Self {
        Self {
            signal,
            saved: Arc::new(Mutex::new(None)),
            no_reschedule,
        }
    }

    /// Capture `state.serialize()` as the checkpoint to attach if this
    /// invocation ends up preempted.  Only the most recent successful save is
    /// retained.
    ///
    /// Passing `None` fails with [`SchedulerError::NilStateSave`]; the error
    /// is returned synchronously and does not terminate the task.
    pub fn save(&self, state: Option<&dyn StateCapability>) -> Result<()> {
        let Some(state) = state else {
            return Err(SchedulerError::NilStateSave);
        };
        let bytes = state.serialize();
        tracing::trace!(event = "checkpoint_saved", state_bytes = bytes.len());
        *self.lock_saved() = Some(bytes);
        Ok(())
    }

    /// Non-blocking poll of the invocation's interrupt signal.
    pub fn is_interrupted(&self) -> bool {
        self.signal.is_set()
    }

    /// Irrevocably mark this request ineligible for reschedule, even if it is
    /// later interrupted.  The flag survives into every subsequent reschedule
    /// decision for the request.
    pub fn cancel_reschedule(&self) {
        self.no_reschedule.store(true, Ordering::Release);
    }

    /// Take the latest checkpoint captured during this invocation, if any.
    pub(crate) fn take_checkpoint(&self) -> Option<Vec<u8>> {
        self.lock_saved().take()
    }

    fn lock_saved(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
