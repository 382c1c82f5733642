//! Executor configuration and per-worker resource minting.
//!
//! The pool shape is validated eagerly at construction: an invalid shape is a
//! [`SchedulerError::Config`] from [`Executor::new`](crate::Executor::new),
//! never a lazy failure.  Two shapes exist:
//!
//! - **multi-worker**: at least one UI worker *and* at least one background
//!   worker, each with a fixed role;
//! - **single-worker**: exactly one worker that serves all three priority
//!   classes with cooperative preemption.
//!
//! Each worker exclusively owns one opaque resource minted by the
//! [`ResourceFactory`] at startup (a connection, a model handle, ...).  The
//! scheduler never looks inside it.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Queue capacity used when the caller does not specify one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Role tag for a worker, handed to the resource factory so it can mint an
/// appropriate resource per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerClass {
    /// Serves the UI and Critical queues; never runs Background work.
    Ui,
    /// Serves the Background queue and the reschedule stack.
    Background,
}

/// Opaque per-worker value produced by the resource factory and passed
/// unchanged to every compute invocation the worker runs.
pub type WorkerResource = Arc<dyn Any + Send + Sync>;

/// Mints one resource per worker at startup.
pub type ResourceFactory = Box<dyn Fn(usize, WorkerClass) -> WorkerResource + Send + Sync>;

/// Worker-pool shape and queue bounds.
pub struct SchedulerConfig {
    /// Number of workers dedicated to the UI and Critical queues.
    pub ui_workers: usize,
    /// Number of workers dedicated to the Background queue.
    pub background_workers: usize,
    /// Capacity of the UI queue.  Zero means unbuffered synchronous hand-off.
    pub queue_capacity_ui: usize,
    /// Capacity of the Critical queue.
    pub queue_capacity_critical: usize,
    /// Capacity of the Background queue.
    pub queue_capacity_background: usize,
    /// Mints the opaque per-worker resource.  The default returns a
    /// null-equivalent `Arc<()>`.
    pub resource_factory: ResourceFactory,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ui_workers: 1,
            background_workers: 1,
            queue_capacity_ui: DEFAULT_QUEUE_CAPACITY,
            queue_capacity_critical: DEFAULT_QUEUE_CAPACITY,
            queue_capacity_background: DEFAULT_QUEUE_CAPACITY,
            resource_factory: Box::new(|_, _| Arc::new(())),
        }
    }
}

impl SchedulerConfig {
    /// Total number of workers in the pool.
    pub fn total_workers(&self) -> usize {
        self.ui_workers + self.background_workers
    }

    /// Whether this configuration collapses all priority classes onto one
    /// worker, enabling the preemption protocol.
    pub fn single_worker(&self) -> bool {
        self.total_workers() == 1
    }

    /// The class of the lone worker in single-worker mode.
    pub(crate) fn single_worker_class(&self) -> WorkerClass {
        if self.ui_workers == 1 {
            WorkerClass::Ui
        } else {
            WorkerClass::Background
        }
    }

    /// Validate the pool shape.  Called by `Executor::new` before anything is
    /// spawned.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.total_workers() == 0 {
            return Err(SchedulerError::Config {
                reason: "at least one worker is required".into(),
            });
        }
        if self.total_workers() > 1 && (self.ui_workers == 0 || self.background_workers == 0) {
            return Err(SchedulerError::Config {
                reason: format!(
                    "a pool of {} workers needs at least one ui worker and one background worker \
                     (got ui={}, background={})",
                    self.total_workers(),
                    self.ui_workers,
                    self.background_workers
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("ui_workers", &self.ui_workers)
            .field("background_workers", &self.background_workers)
            .field("queue_capacity_ui", &self.queue_capacity_ui)
            .field("queue_capacity_critical", &self.queue_capacity_critical)
            .field("queue_capacity_background", &self.queue_capacity_background)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
