//! Signal handling for run cancellation.
//!
//! SIGINT and SIGTERM do not kill the process mid-write. They set an atomic
//! flag that a poll thread forwards to the run's [`CancelFlag`]: no new cycle
//! starts and the partial report is still written.

use hotplug_runtime::CancelFlag;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How often the poll thread checks the signal flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signal types that cancel a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// State shared between the poll thread and the caller.
#[derive(Debug, Default)]
pub struct SignalState {
    signal_count: AtomicU32,
    last_signal: AtomicU32,
}

impl SignalState {
    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(kind as u32 + 1, Ordering::Relaxed);
    }

    /// Number of cancelling signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// The most recent signal, if any.
    pub fn last_signal(&self) -> Option<SignalKind> {
        match self.last_signal.load(Ordering::Relaxed) {
            1 => Some(SignalKind::Terminate),
            2 => Some(SignalKind::Interrupt),
            _ => None,
        }
    }
}

static TERM_FLAG: AtomicBool = AtomicBool::new(false);
static INT_FLAG: AtomicBool = AtomicBool::new(false);

/// Forwards SIGINT/SIGTERM to a [`CancelFlag`].
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
    cancel: CancelFlag,
}

impl SignalHandler {
    /// Register handlers that cancel `cancel`.
    pub fn new(cancel: CancelFlag) -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::default()),
            cancel,
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        std::thread::Builder::new()
            .name("hotplug-signals".into())
            .spawn(move || loop {
                let flags = [
                    (&TERM_FLAG, SignalKind::Terminate),
                    (&INT_FLAG, SignalKind::Interrupt),
                ];
                for (flag, kind) in flags {
                    if flag.swap(false, Ordering::Relaxed) {
                        info!(signal = %kind, "Signal received, stopping after the current stage");
                        state.record_signal(kind);
                        cancel.cancel();
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            })?;

        // SAFETY: the handlers only store to static atomics.
        unsafe {
            libc::signal(libc::SIGTERM, sigterm_handler as libc::sighandler_t);
            libc::signal(libc::SIGINT, sigint_handler as libc::sighandler_t);
        }

        extern "C" fn sigterm_handler(_: c_int) {
            TERM_FLAG.store(true, Ordering::Relaxed);
        }

        extern "C" fn sigint_handler(_: c_int) {
            INT_FLAG.store(true, Ordering::Relaxed);
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Whether the run was cancelled.
    #[inline]
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal bookkeeping.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::default();
        assert_eq!(state.signal_count(), 0);
        assert_eq!(state.last_signal(), None);
    }

    #[test]
    fn test_record_signal() {
        let state = SignalState::default();
        state.record_signal(SignalKind::Interrupt);
        assert_eq!(state.signal_count(), 1);
        assert_eq!(state.last_signal(), Some(SignalKind::Interrupt));
    }

    #[test]
    fn test_flag_forwards_to_cancel() {
        let cancel = CancelFlag::new();
        let handler = SignalHandler::new(cancel.clone()).unwrap();
        assert!(!handler.cancelled());

        TERM_FLAG.store(true, Ordering::Relaxed);
        for _ in 0..500 {
            if cancel.is_cancelled() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        assert!(handler.cancelled());
        assert_eq!(handler.state().last_signal(), Some(SignalKind::Terminate));
    }
}
