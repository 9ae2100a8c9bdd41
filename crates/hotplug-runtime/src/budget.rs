//! Run budget and cancellation.
//!
//! Once the wall-clock budget is spent or cancellation is requested, no new
//! cycle starts and the stage in flight is the last one that runs.

use hotplug_common::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Shared cancellation flag, settable from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not yet set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            info!("Run cancellation requested");
        }
    }

    /// Whether cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deadline plus cancellation for one run.
#[derive(Debug, Clone)]
pub struct RunBudget {
    clock: Arc<dyn Clock>,
    deadline: Option<Instant>,
    cancel: CancelFlag,
}

impl RunBudget {
    /// Start a budget of `limit` now; `None` means unlimited.
    pub fn start(clock: Arc<dyn Clock>, limit: Option<Duration>, cancel: CancelFlag) -> Self {
        let deadline = limit.map(|l| clock.now() + l);
        Self {
            clock,
            deadline,
            cancel,
        }
    }

    /// True once the deadline passed or cancellation was requested.
    pub fn exhausted(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| self.clock.now() >= d)
    }

    /// Time left, if bounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(self.clock.now()))
    }
}
