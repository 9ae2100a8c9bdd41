//! Bounded-timeout polling.
//!
//! Control-file writes are fire-and-forget; the kernel offers no completion
//! signal. Every asynchronous effect is therefore observed by re-evaluating a
//! predicate until it holds or the timeout elapses.
//!
//! Predicate errors come in two flavours:
//!
//! - [`PollError::Transient`] counts as a false evaluation and polling goes on.
//! - [`PollError::Abort`] ends polling at once and is returned to the caller.

use crate::clock::{Clock, SystemClock};
use crate::error::{HotplugError, HotplugResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Smallest interval the waiter will sleep between evaluations.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Error returned from a poll predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PollError {
    /// Treated as "not yet"; polling continues.
    Transient(String),
    /// Stops polling and propagates.
    Abort(HotplugError),
}

impl PollError {
    /// Wrap any displayable error as transient.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<HotplugError> for PollError {
    fn from(err: HotplugError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Polls predicates against a [`Clock`].
#[derive(Debug, Clone)]
pub struct PollWaiter {
    clock: Arc<dyn Clock>,
}

impl Default for PollWaiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl PollWaiter {
    /// Create a waiter on the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// The clock this waiter sleeps on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Sleep unconditionally; used for settle floors.
    pub fn settle(&self, duration: Duration) {
        if !duration.is_zero() {
            debug!(settle_ms = duration.as_millis(), "Settling");
            self.clock.sleep(duration);
        }
    }

    /// Evaluate `predicate` until it returns `Ok(true)` or `timeout` elapses.
    ///
    /// The first evaluation happens immediately, so an already-true predicate
    /// returns without sleeping. A zero timeout checks exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::PollAborted`] (or the wrapped error) when the
    /// predicate returns [`PollError::Abort`].
    pub fn wait_for<F>(
        &self,
        mut predicate: F,
        timeout: Duration,
        interval: Duration,
    ) -> HotplugResult<bool>
    where
        F: FnMut() -> Result<bool, PollError>,
    {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let start = self.clock.now();
        let mut evaluations: u64 = 0;

        loop {
            evaluations += 1;
            match predicate() {
                Ok(true) => {
                    trace!(evaluations, "Poll condition met");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(PollError::Transient(reason)) => {
                    debug!(%reason, "Transient poll error, treating as not ready");
                }
                Err(PollError::Abort(err)) => {
                    debug!(error = %err, evaluations, "Polling aborted");
                    return Err(err);
                }
            }

            if self.clock.now().duration_since(start) >= timeout {
                debug!(
                    evaluations,
                    timeout_ms = timeout.as_millis(),
                    "Poll condition not met before timeout"
                );
                return Ok(false);
            }

            self.clock.sleep(interval);
        }
    }

    /// Infallible variant of [`wait_for`](Self::wait_for).
    pub fn wait_until<F>(&self, mut predicate: F, timeout: Duration, interval: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        self.wait_for(|| Ok(predicate()), timeout, interval)
            .unwrap_or(false)
    }
}
