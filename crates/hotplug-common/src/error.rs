use thiserror::Error;

/// Hot-plug error types covering setup failures, control-file I/O and
/// non-converging lifecycle stages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HotplugError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A resource descriptor could not be mapped to a control path.
    #[error("cannot resolve resource '{descriptor}': {reason}")]
    UnresolvedResource {
        /// Descriptor as supplied by the caller.
        descriptor: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Writing a control attribute failed (permission denied, path missing).
    #[error("control write to {path} failed: {reason}")]
    FatalIo {
        /// Control attribute path.
        path: String,
        /// Underlying I/O error text.
        reason: String,
    },

    /// A poll did not converge within its timeout.
    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout {
        /// Lifecycle stage name.
        stage: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A recovery probe could not be executed.
    #[error("probe error: {0}")]
    Probe(String),

    /// A poll predicate asked for polling to stop early.
    #[error("polling aborted: {0}")]
    PollAborted(String),

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Coarse classification used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Setup-time failure; surfaced to the caller, never retried.
    Configuration,
    /// Non-convergence; recorded and the run continues.
    Transient,
    /// Persistent control failure; the resource is skipped for the rest of the run.
    Fatal,
}

impl HotplugError {
    /// Classify this error according to its propagation policy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::UnresolvedResource { .. } => ErrorKind::Configuration,
            Self::FatalIo { .. } | Self::InvalidStateTransition { .. } => ErrorKind::Fatal,
            Self::StageTimeout { .. } | Self::Probe(_) | Self::PollAborted(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Build an [`HotplugError::UnresolvedResource`].
    pub fn unresolved(descriptor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedResource {
            descriptor: descriptor.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`HotplugError::FatalIo`] from an I/O error on `path`.
    pub fn fatal_io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::FatalIo {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convenience type alias for hot-plug operations.
pub type HotplugResult<T> = Result<T, HotplugError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            HotplugError::unresolved("cpu99", "out of range").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            HotplugError::Config("bad".into()).kind(),
            ErrorKind::Configuration
        );
        let io = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let fatal = HotplugError::fatal_io(std::path::Path::new("/sys/x/power"), &io);
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(fatal.to_string().contains("/sys/x/power"));
        assert_eq!(
            HotplugError::StageTimeout {
                stage: "VERIFY_ABSENT".into(),
                timeout_ms: 10_000
            }
            .kind(),
            ErrorKind::Transient
        );
    }
}
