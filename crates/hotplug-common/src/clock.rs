//! Time source used by polling, settle delays and stage timestamps.
//!
//! [`SystemClock`] sleeps for real. [`ManualClock`] advances a virtual
//! timeline on every sleep, so multi-minute timeouts run instantly under test
//! and sleeps can be counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Monotonic time source with a blocking sleep.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Wall-clock time, used only for report timestamps.
    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Real clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock; `sleep` returns immediately after advancing time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: SystemTime,
    offset_ns: AtomicU64,
    sleeps: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: SystemTime::now(),
            offset_ns: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
        }
    }

    /// Create a shared clock.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advance virtual time without counting a sleep.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }

    /// Number of `sleep` calls so far.
    #[must_use]
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::Acquire)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::AcqRel);
        self.advance(duration);
    }

    fn wall(&self) -> SystemTime {
        self.wall_origin + self.elapsed()
    }
}
