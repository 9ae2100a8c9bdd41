//! Run-wide result collection.
//!
//! Every stage attempt and every recovery verdict is appended here. Nothing
//! is reset between resources or iterations, so the final report names every
//! resource that ever failed.

use hotplug_common::{DeviceClass, Resource, Stage, StageOutcome};
use hotplug_sysfs::{ExcludedResource, OrderingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// One stage of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleAttempt {
    /// Resource id.
    pub resource: String,
    /// Class the resource was resolved to.
    pub class: DeviceClass,
    /// Iteration number, starting at 1.
    pub iteration: u32,
    /// Stage attempted.
    pub stage: Stage,
    /// How it ended.
    pub outcome: StageOutcome,
    /// Error or timeout text for non-`Ok` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Stage start.
    #[serde(with = "rfc3339")]
    pub started_at: SystemTime,
    /// Stage end.
    #[serde(with = "rfc3339")]
    pub ended_at: SystemTime,
}

/// Verdict of the `Recover` stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Resource id.
    pub resource: String,
    /// Iteration number, starting at 1.
    pub iteration: u32,
    /// Whether the resource is functionally restored.
    pub verified: bool,
    /// What did not recover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_detail: Option<String>,
}

/// A cycle that was cut short by the run budget or cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptedCycle {
    /// Resource id.
    pub resource: String,
    /// Iteration number, starting at 1.
    pub iteration: u32,
}

/// Pass/fail verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Every resource with at least one failed cycle.
    pub failed_resource_ids: BTreeSet<String>,
    /// One line per failed stage or recovery.
    pub detail: Vec<String>,
}

impl Summary {
    /// The run passes iff no resource failed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failed_resource_ids.is_empty()
    }
}

/// Everything recorded during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Ordering used for every iteration.
    pub strategy: OrderingStrategy,
    /// Seed to replay a randomized run.
    pub seed: Option<u64>,
    /// Resources exercised.
    pub resources: Vec<Resource>,
    /// Descriptors dropped at resolution.
    #[serde(default)]
    pub excluded: Vec<ExcludedResource>,
    /// Requested iterations per resource.
    pub iterations: u32,
    /// Stage attempts in the order they finished.
    pub attempts: Vec<LifecycleAttempt>,
    /// Recovery verdicts.
    pub recoveries: Vec<RecoveryOutcome>,
    /// Resources skipped after a control write failed.
    #[serde(default)]
    pub abandoned: Vec<String>,
    /// Cycles cut short by budget or cancellation.
    #[serde(default)]
    pub interrupted: Vec<InterruptedCycle>,
    /// Whether the run stopped before all cycles were issued.
    pub truncated: bool,
    /// Run start.
    #[serde(with = "rfc3339")]
    pub started_at: SystemTime,
    /// Run end.
    #[serde(with = "rfc3339")]
    pub finished_at: SystemTime,
}

impl RunReport {
    /// Create an empty report.
    pub fn new(
        strategy: OrderingStrategy,
        resources: Vec<Resource>,
        iterations: u32,
        started_at: SystemTime,
    ) -> Self {
        Self {
            strategy,
            seed: strategy.seed(),
            resources,
            excluded: Vec::new(),
            iterations,
            attempts: Vec::new(),
            recoveries: Vec::new(),
            abandoned: Vec::new(),
            interrupted: Vec::new(),
            truncated: false,
            started_at,
            finished_at: started_at,
        }
    }

    /// Derive the verdict from recorded attempts and recoveries.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();

        for attempt in self.attempts.iter().filter(|a| !a.outcome.is_ok()) {
            summary.failed_resource_ids.insert(attempt.resource.clone());
            let mut line = format!(
                "{} iteration {}: {} {}",
                attempt.resource, attempt.iteration, attempt.stage, attempt.outcome
            );
            if let Some(detail) = &attempt.detail {
                line.push_str(": ");
                line.push_str(detail);
            }
            summary.detail.push(line);
        }

        for outcome in self.recoveries.iter().filter(|o| !o.verified) {
            summary.failed_resource_ids.insert(outcome.resource.clone());
            summary.detail.push(format!(
                "{} iteration {}: not recovered ({})",
                outcome.resource,
                outcome.iteration,
                outcome.failing_detail.as_deref().unwrap_or("no detail")
            ));
        }

        summary
    }

    /// Number of cycles that ended with a verified recovery.
    pub fn recovered_cycles(&self) -> usize {
        self.recoveries.iter().filter(|o| o.verified).count()
    }

    /// Number of distinct (resource, iteration) cycles with at least one attempt.
    pub fn cycles_started(&self) -> usize {
        self.attempts
            .iter()
            .map(|a| (a.resource.as_str(), a.iteration))
            .collect::<BTreeSet<_>>()
            .len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        if summary.passed() {
            write!(f, "all {} resources recovered", self.resources.len())?;
        } else {
            let ids: Vec<&str> = summary.failed_resource_ids.iter().map(String::as_str).collect();
            write!(f, "following devices failed: {}", ids.join(", "))?;
        }
        if self.truncated {
            write!(f, " (run truncated)")?;
        }
        Ok(())
    }
}

/// Thread-safe, append-only collector for one run.
#[derive(Debug)]
pub struct ResultAggregator {
    report: Mutex<RunReport>,
}

impl ResultAggregator {
    /// Start collecting into `report`.
    pub fn new(report: RunReport) -> Self {
        Self {
            report: Mutex::new(report),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a stage attempt.
    pub fn record_attempt(&self, attempt: LifecycleAttempt) {
        self.lock().attempts.push(attempt);
    }

    /// Append a recovery verdict.
    pub fn record_outcome(&self, outcome: RecoveryOutcome) {
        self.lock().recoveries.push(outcome);
    }

    /// Mark `resource` as skipped for the rest of the run.
    pub fn record_abandoned(&self, resource: &str) {
        let mut report = self.lock();
        if !report.abandoned.iter().any(|r| r == resource) {
            report.abandoned.push(resource.to_string());
        }
    }

    /// Note a cycle cut short by the budget and flag the run as truncated.
    pub fn record_interrupted(&self, resource: &str, iteration: u32) {
        let mut report = self.lock();
        report.interrupted.push(InterruptedCycle {
            resource: resource.to_string(),
            iteration,
        });
        report.truncated = true;
    }

    /// Flag the run as truncated.
    pub fn mark_truncated(&self) {
        self.lock().truncated = true;
    }

    /// Record descriptors dropped at resolution.
    pub fn set_excluded(&self, excluded: Vec<ExcludedResource>) {
        self.lock().excluded = excluded;
    }

    /// Current verdict.
    pub fn summary(&self) -> Summary {
        self.lock().summary()
    }

    /// Snapshot of the report so far.
    pub fn snapshot(&self) -> RunReport {
        self.lock().clone()
    }

    /// Close the report at `finished_at`.
    pub fn finish(self, finished_at: SystemTime) -> RunReport {
        let mut report = self.report.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.finished_at = finished_at;
        report
    }
}

/// RFC 3339 timestamps with millisecond precision.
mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_rfc3339_millis(*time).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_rfc3339_weak(&s).map_err(serde::de::Error::custom)
    }
}
