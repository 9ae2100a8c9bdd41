//! Remove/add/recover cycles across resources and iterations.
//!
//! Each cycle walks the [`CycleStateMachine`] one stage at a time. A stage
//! runs only if the previous one was `Ok`; a stage that fails ends its cycle
//! and the run moves on to the next resource or iteration. A failed control
//! write is the one persistent condition: the resource is abandoned for the
//! rest of the run.
//!
//! In parallel mode every control path gets its own worker. Resources that
//! share a control path (functions of one slot) are cycled one after the
//! other inside that worker, never concurrently.

use crate::aggregator::{LifecycleAttempt, RecoveryOutcome, ResultAggregator, RunReport};
use crate::budget::{CancelFlag, RunBudget};
use crate::recovery::RecoverySuite;
use hotplug_common::{
    CycleState, CycleStateMachine, ErrorKind, HotplugConfig, HotplugError, HotplugResult,
    PollWaiter, Resource, Stage, StageOutcome,
};
use hotplug_sysfs::{OrderingStrategy, Resolution, ResourceControl, ResourceOrder};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Cycles per resource.
    pub iterations: u32,
    /// `VerifyAbsent` timeout.
    pub remove_timeout: Duration,
    /// `VerifyPresent` timeout.
    pub add_timeout: Duration,
    /// Delay between poll evaluations.
    pub poll_interval: Duration,
    /// Wall-clock budget for the run.
    pub budget: Option<Duration>,
    /// One worker thread per control path.
    pub parallel: bool,
    /// Re-add a resource left removed by a failed cycle.
    pub restore_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&HotplugConfig::default())
    }
}

impl OrchestratorConfig {
    /// Extract orchestrator settings from the run configuration.
    pub fn from_config(config: &HotplugConfig) -> Self {
        Self {
            iterations: config.iterations,
            remove_timeout: config.timeouts.remove,
            add_timeout: config.timeouts.add,
            poll_interval: config.timeouts.poll_interval,
            budget: config.run.budget,
            parallel: config.run.parallel,
            restore_on_failure: config.run.restore_on_failure,
        }
    }
}

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// All stages passed.
    Recovered,
    /// A stage failed; later iterations still run.
    Failed,
    /// A control write failed; no further cycles for this resource.
    Abandoned,
    /// Budget spent or cancellation requested mid-cycle.
    Interrupted,
}

/// Drives hot-plug cycles and aggregates their results.
pub struct LifecycleOrchestrator {
    control: Arc<dyn ResourceControl>,
    verifiers: RecoverySuite,
    waiter: PollWaiter,
    config: OrchestratorConfig,
    cancel: CancelFlag,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        control: Arc<dyn ResourceControl>,
        verifiers: RecoverySuite,
        waiter: PollWaiter,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            control,
            verifiers,
            waiter,
            config,
            cancel: CancelFlag::new(),
        }
    }

    /// Share an externally owned cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops the run when set.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Settings in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run every resolved resource and record the excluded descriptors.
    pub fn run_resolution(&self, resolution: &Resolution, strategy: OrderingStrategy) -> RunReport {
        let aggregator = self.start(&resolution.resources, strategy);
        aggregator.set_excluded(resolution.excluded.clone());
        self.execute(&resolution.resources, strategy, aggregator)
    }

    /// Run `iterations` cycles for each resource.
    pub fn run(&self, resources: &[Resource], strategy: OrderingStrategy) -> RunReport {
        let aggregator = self.start(resources, strategy);
        self.execute(resources, strategy, aggregator)
    }

    fn start(&self, resources: &[Resource], strategy: OrderingStrategy) -> ResultAggregator {
        ResultAggregator::new(RunReport::new(
            strategy,
            unique(resources),
            self.config.iterations,
            self.waiter.clock().wall(),
        ))
    }

    fn execute(
        &self,
        resources: &[Resource],
        strategy: OrderingStrategy,
        aggregator: ResultAggregator,
    ) -> RunReport {
        let resources = unique(resources);
        let budget = RunBudget::start(
            self.waiter.clock().clone(),
            self.config.budget,
            self.cancel.clone(),
        );

        info!(
            resources = resources.len(),
            iterations = self.config.iterations,
            %strategy,
            parallel = self.config.parallel,
            "Starting hot-plug run"
        );

        let groups = control_groups(&resources);
        if self.config.parallel && groups.len() > 1 {
            self.run_parallel(&groups, strategy, &budget, &aggregator);
        } else {
            self.run_sequential(&resources, strategy, &budget, &aggregator);
        }

        let report = aggregator.finish(self.waiter.clock().wall());
        info!(
            cycles = report.cycles_started(),
            recovered = report.recovered_cycles(),
            truncated = report.truncated,
            "{report}"
        );
        report
    }

    fn run_sequential(
        &self,
        resources: &[Resource],
        strategy: OrderingStrategy,
        budget: &RunBudget,
        aggregator: &ResultAggregator,
    ) {
        let mut order = ResourceOrder::new(strategy);
        let mut abandoned: HashSet<String> = HashSet::new();

        'run: for iteration in 1..=self.config.iterations {
            let round = order.next_round(resources);
            let ids: Vec<&str> = round.iter().map(|r| r.id.as_str()).collect();
            debug!(iteration, order = ?ids, "Iteration order");

            for resource in &round {
                if abandoned.contains(&resource.id) {
                    continue;
                }
                if budget.exhausted() {
                    warn!(iteration, "Run budget exhausted, no further cycles");
                    aggregator.mark_truncated();
                    break 'run;
                }
                match self.run_cycle(resource, iteration, budget, aggregator) {
                    CycleEnd::Abandoned => {
                        abandoned.insert(resource.id.clone());
                    }
                    CycleEnd::Interrupted => break 'run,
                    CycleEnd::Recovered | CycleEnd::Failed => {}
                }
            }
        }
    }

    fn run_parallel(
        &self,
        groups: &[Vec<Resource>],
        strategy: OrderingStrategy,
        budget: &RunBudget,
        aggregator: &ResultAggregator,
    ) {
        debug!(workers = groups.len(), "Parallel run, ordering applies per worker only");
        std::thread::scope(|scope| {
            for group in groups {
                let Some(first) = group.first() else {
                    continue;
                };
                if group.len() > 1 {
                    info!(
                        control_path = %first.control_path,
                        resources = group.len(),
                        "Resources share a control path, cycling them in one worker"
                    );
                }
                let worker = move || self.run_sequential(group, strategy, budget, aggregator);
                let spawned = std::thread::Builder::new()
                    .name(format!("hotplug-{}", first.id))
                    .spawn_scoped(scope, worker);
                if let Err(e) = spawned {
                    warn!(resource = %first.id, error = %e, "Cannot spawn worker, running inline");
                    self.run_sequential(group, strategy, budget, aggregator);
                }
            }
        });
    }

    /// Run one remove/add/recover cycle.
    pub fn run_cycle(
        &self,
        resource: &Resource,
        iteration: u32,
        budget: &RunBudget,
        aggregator: &ResultAggregator,
    ) -> CycleEnd {
        let mut machine = CycleStateMachine::new();
        let cycle = Cycle {
            resource,
            iteration,
            aggregator,
        };

        info!(resource = %resource.id, iteration, class = %resource.class, "Starting cycle");
        let end = match self.drive(&cycle, &mut machine, budget) {
            Ok(end) => end,
            Err(err) => {
                error!(resource = %resource.id, iteration, error = %err, "Cycle aborted");
                cycle.record(
                    stage_for(machine.state()),
                    StageOutcome::Errored,
                    Some(err.to_string()),
                    self.waiter.clock().wall(),
                    self.waiter.clock().wall(),
                );
                CycleEnd::Failed
            }
        };

        if end != CycleEnd::Recovered {
            self.restore(resource, machine.state());
            if end != CycleEnd::Interrupted {
                machine.fail();
            }
        }

        match end {
            CycleEnd::Recovered => info!(resource = %resource.id, iteration, "Cycle recovered"),
            CycleEnd::Interrupted => {
                warn!(
                    resource = %resource.id,
                    iteration,
                    state = %machine.state(),
                    "Cycle interrupted"
                );
                aggregator.record_interrupted(&resource.id, iteration);
            }
            CycleEnd::Failed | CycleEnd::Abandoned => {
                warn!(resource = %resource.id, iteration, "Cycle failed");
            }
        }
        end
    }

    fn drive(
        &self,
        cycle: &Cycle<'_>,
        machine: &mut CycleStateMachine,
        budget: &RunBudget,
    ) -> HotplugResult<CycleEnd> {
        let resource = cycle.resource;
        let clock = self.waiter.clock();

        // Remove
        let started = clock.wall();
        if let Err(err) = self.control.request_remove(resource) {
            return Ok(self.write_failed(cycle, Stage::Remove, err, started));
        }
        cycle.record(Stage::Remove, StageOutcome::Ok, None, started, clock.wall());
        machine.transition(CycleState::Removing)?;

        // VerifyAbsent
        let started = clock.wall();
        let absent = self.waiter.wait_for(
            || Ok(!self.control.is_present(resource)?),
            self.config.remove_timeout,
            self.config.poll_interval,
        );
        if !self.verify_stage(
            cycle,
            Stage::VerifyAbsent,
            absent,
            self.config.remove_timeout,
            started,
        ) {
            return Ok(CycleEnd::Failed);
        }
        machine.transition(CycleState::Absent)?;
        if budget.exhausted() {
            return Ok(CycleEnd::Interrupted);
        }

        // Add
        let started = clock.wall();
        if let Err(err) = self.control.request_add(resource) {
            return Ok(self.write_failed(cycle, Stage::Add, err, started));
        }
        cycle.record(Stage::Add, StageOutcome::Ok, None, started, clock.wall());
        machine.transition(CycleState::Adding)?;

        // VerifyPresent
        let started = clock.wall();
        let present = self.waiter.wait_for(
            || Ok(self.control.is_present(resource)?),
            self.config.add_timeout,
            self.config.poll_interval,
        );
        if !self.verify_stage(
            cycle,
            Stage::VerifyPresent,
            present,
            self.config.add_timeout,
            started,
        ) {
            return Ok(CycleEnd::Failed);
        }
        machine.transition(CycleState::Restored)?;
        if budget.exhausted() {
            return Ok(CycleEnd::Interrupted);
        }

        // Recover
        let verifier = self.verifiers.for_class(resource.class);
        machine.transition(CycleState::Recovering)?;
        self.waiter.settle(verifier.settle_time());
        let started = clock.wall();
        let verification = verifier.verify(resource, &self.waiter);
        let ended = clock.wall();

        let (verified, failing_detail, outcome) = match verification {
            Ok(v) if v.verified => (true, None, StageOutcome::Ok),
            Ok(v) => (false, v.failing_detail, StageOutcome::TimedOut),
            Err(err) => (false, Some(err.to_string()), StageOutcome::Errored),
        };
        cycle.record(Stage::Recover, outcome, failing_detail.clone(), started, ended);
        cycle.aggregator.record_outcome(RecoveryOutcome {
            resource: resource.id.clone(),
            iteration: cycle.iteration,
            verified,
            failing_detail,
        });

        if verified {
            machine.transition(CycleState::Recovered)?;
            Ok(CycleEnd::Recovered)
        } else {
            Ok(CycleEnd::Failed)
        }
    }

    /// Record the outcome of a polling stage; true if it passed.
    fn verify_stage(
        &self,
        cycle: &Cycle<'_>,
        stage: Stage,
        result: HotplugResult<bool>,
        timeout: Duration,
        started: SystemTime,
    ) -> bool {
        let ended = self.waiter.clock().wall();
        let elapsed_ms = ended.duration_since(started).unwrap_or_default().as_millis();
        match result {
            Ok(true) => {
                debug!(
                    resource = %cycle.resource.id,
                    iteration = cycle.iteration,
                    %stage,
                    elapsed_ms,
                    "Stage ok"
                );
                cycle.record(stage, StageOutcome::Ok, None, started, ended);
                true
            }
            Ok(false) => {
                let err = HotplugError::StageTimeout {
                    stage: stage.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                warn!(
                    resource = %cycle.resource.id,
                    iteration = cycle.iteration,
                    %stage,
                    elapsed_ms,
                    "Stage timed out"
                );
                cycle.record(
                    stage,
                    StageOutcome::TimedOut,
                    Some(err.to_string()),
                    started,
                    ended,
                );
                false
            }
            Err(err) => {
                warn!(
                    resource = %cycle.resource.id,
                    iteration = cycle.iteration,
                    %stage,
                    error = %err,
                    "Stage errored"
                );
                cycle.record(
                    stage,
                    StageOutcome::Errored,
                    Some(err.to_string()),
                    started,
                    ended,
                );
                false
            }
        }
    }

    fn write_failed(
        &self,
        cycle: &Cycle<'_>,
        stage: Stage,
        err: HotplugError,
        started: SystemTime,
    ) -> CycleEnd {
        cycle.record(
            stage,
            StageOutcome::Errored,
            Some(err.to_string()),
            started,
            self.waiter.clock().wall(),
        );
        if err.kind() == ErrorKind::Fatal {
            error!(
                resource = %cycle.resource.id,
                iteration = cycle.iteration,
                %stage,
                error = %err,
                "Control write failed, abandoning resource for the rest of the run"
            );
            cycle.aggregator.record_abandoned(&cycle.resource.id);
            CycleEnd::Abandoned
        } else {
            warn!(
                resource = %cycle.resource.id,
                iteration = cycle.iteration,
                %stage,
                error = %err,
                "Control write failed"
            );
            CycleEnd::Failed
        }
    }

    /// Best-effort re-add of a resource the cycle left removed.
    fn restore(&self, resource: &Resource, state: CycleState) {
        let removed = matches!(state, CycleState::Removing | CycleState::Absent);
        if !self.config.restore_on_failure || !removed {
            return;
        }
        match self.control.request_add(resource) {
            Ok(()) => info!(resource = %resource.id, "Re-enabled resource after failed cycle"),
            Err(err) => {
                warn!(resource = %resource.id, error = %err, "Could not re-enable resource");
            }
        }
    }
}

/// Per-cycle recording context.
struct Cycle<'a> {
    resource: &'a Resource,
    iteration: u32,
    aggregator: &'a ResultAggregator,
}

impl Cycle<'_> {
    fn record(
        &self,
        stage: Stage,
        outcome: StageOutcome,
        detail: Option<String>,
        started_at: SystemTime,
        ended_at: SystemTime,
    ) {
        self.aggregator.record_attempt(LifecycleAttempt {
            resource: self.resource.id.clone(),
            class: self.resource.class,
            iteration: self.iteration,
            stage,
            outcome,
            detail,
            started_at,
            ended_at,
        });
    }
}

/// Stage that runs while the cycle sits in `state`.
fn stage_for(state: CycleState) -> Stage {
    match state {
        CycleState::Present => Stage::Remove,
        CycleState::Removing => Stage::VerifyAbsent,
        CycleState::Absent => Stage::Add,
        CycleState::Adding => Stage::VerifyPresent,
        CycleState::Restored
        | CycleState::Recovering
        | CycleState::Recovered
        | CycleState::Failed => Stage::Recover,
    }
}

/// Partition resources by control path, keeping first-occurrence order.
fn control_groups(resources: &[Resource]) -> Vec<Vec<Resource>> {
    let mut groups: Vec<Vec<Resource>> = Vec::new();
    for resource in resources {
        let path = &resource.control_path;
        match groups.iter_mut().find(|g| &g[0].control_path == path) {
            Some(group) => group.push(resource.clone()),
            None => groups.push(vec![resource.clone()]),
        }
    }
    groups
}

/// Drop repeated ids, keeping first occurrence.
fn unique(resources: &[Resource]) -> Vec<Resource> {
    let mut seen = HashSet::new();
    resources
        .iter()
        .filter(|r| seen.insert(r.id.clone()))
        .cloned()
        .collect()
}
