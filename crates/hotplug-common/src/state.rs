//! Lifecycle state machine for one hot-plug cycle.
//!
//! A cycle walks:
//! PRESENT → REMOVING → ABSENT → ADDING → RESTORED → RECOVERING → RECOVERED
//!
//! FAILED is reachable from every non-terminal state, which is how a stage
//! that did not converge ends its cycle.

use crate::error::{HotplugError, HotplugResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered stages of a cycle. A stage only runs if the previous one was `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Write the disable value to the control attribute.
    Remove,
    /// Wait until the resource disappears from enumeration.
    VerifyAbsent,
    /// Write the enable value to the control attribute.
    Add,
    /// Wait until the resource reappears in enumeration.
    VerifyPresent,
    /// Class-specific functional check.
    Recover,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Remove,
        Stage::VerifyAbsent,
        Stage::Add,
        Stage::VerifyPresent,
        Stage::Recover,
    ];

    /// Stage that follows this one, if any.
    #[must_use]
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Remove => Some(Self::VerifyAbsent),
            Self::VerifyAbsent => Some(Self::Add),
            Self::Add => Some(Self::VerifyPresent),
            Self::VerifyPresent => Some(Self::Recover),
            Self::Recover => None,
        }
    }

    /// Whether this stage writes a control attribute.
    #[must_use]
    pub fn is_control_write(self) -> bool {
        matches!(self, Self::Remove | Self::Add)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remove => write!(f, "REMOVE"),
            Self::VerifyAbsent => write!(f, "VERIFY_ABSENT"),
            Self::Add => write!(f, "ADD"),
            Self::VerifyPresent => write!(f, "VERIFY_PRESENT"),
            Self::Recover => write!(f, "RECOVER"),
        }
    }
}

/// Result of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage completed.
    Ok,
    /// A poll did not converge in time.
    TimedOut,
    /// The stage failed outright.
    Errored,
}

impl StageOutcome {
    /// True for [`StageOutcome::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// States of a single remove/add/recover cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    /// Resource present, cycle not started.
    #[default]
    Present,
    /// Removal requested, waiting for it to disappear.
    Removing,
    /// Resource confirmed absent.
    Absent,
    /// Addition requested, waiting for it to reappear.
    Adding,
    /// Resource present again, not yet functionally checked.
    Restored,
    /// Class-specific recovery check running.
    Recovering,
    /// Cycle passed.
    Recovered,
    /// Cycle failed at some stage.
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => write!(f, "PRESENT"),
            Self::Removing => write!(f, "REMOVING"),
            Self::Absent => write!(f, "ABSENT"),
            Self::Adding => write!(f, "ADDING"),
            Self::Restored => write!(f, "RESTORED"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Recovered => write!(f, "RECOVERED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl CycleState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::{
            Absent, Adding, Failed, Present, Recovered, Recovering, Removing, Restored,
        };

        matches!(
            (self, target),
            (Present, Removing)
                | (Removing, Absent)
                | (Absent, Adding)
                | (Adding, Restored)
                | (Restored, Recovering)
                | (Recovering, Recovered)
                | (Present | Removing | Absent | Adding | Restored | Recovering, Failed)
        )
    }

    /// Returns true once the cycle has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recovered | Self::Failed)
    }
}

/// State machine wrapper with transition counting.
#[derive(Debug, Clone, Default)]
pub struct CycleStateMachine {
    current: CycleState,
    previous: Option<CycleState>,
    transition_count: u32,
}

impl CycleStateMachine {
    /// Create a new state machine starting in PRESENT.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> CycleState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<CycleState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: CycleState) -> HotplugResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(HotplugError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Mark the cycle failed; a no-op once terminal.
    pub fn fail(&mut self) {
        if self.current.can_transition_to(CycleState::Failed) {
            self.previous = Some(self.current);
            self.current = CycleState::Failed;
            self.transition_count += 1;
        }
    }
}
