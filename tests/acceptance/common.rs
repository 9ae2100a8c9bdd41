//! Common utilities for acceptance tests.
//!
//! Provides a simulated test bench:
//! - One virtual clock shared by control, probes and the poll waiter
//! - Simulated control with fault injection
//! - Link, reachability and multipath probes with call counters

#![allow(dead_code)] // Not every scenario uses every helper

use hotplug_common::{DeviceClass, HotplugConfig, ManualClock, PollWaiter, Resource};
use hotplug_runtime::{LifecycleOrchestrator, OrchestratorConfig, RecoverySuite, RunReport};
use hotplug_sysfs::{
    simulated_resource, OrderingStrategy, SimulatedControl, SimulatedFault, SimulatedLinkProbe,
    SimulatedPathProbe, SimulatedReachability,
};
use std::sync::Arc;
use std::time::Duration;

/// Peer used by every network scenario.
pub const PEER: &str = "10.0.0.2";

/// Simulated hardware plus the configuration a run is built from.
pub struct TestBench {
    pub clock: Arc<ManualClock>,
    pub control: Arc<SimulatedControl>,
    pub link: Arc<SimulatedLinkProbe>,
    pub reach: Arc<SimulatedReachability>,
    pub paths: Arc<SimulatedPathProbe>,
    pub config: HotplugConfig,
}

impl TestBench {
    /// Bench where `present` resources are visible and links come up after
    /// `link_delay` (`None` keeps them down).
    pub fn new(present: &[&str], link_delay: Option<Duration>, peer_reachable: bool) -> Self {
        let clock = ManualClock::shared();
        let mut config = HotplugConfig::default();
        config.recovery.network.peer = Some(PEER.parse().unwrap());

        Self {
            control: Arc::new(SimulatedControl::new(clock.clone(), present.iter().copied())),
            link: Arc::new(SimulatedLinkProbe::new(clock.clone(), link_delay)),
            reach: Arc::new(SimulatedReachability::new(peer_reachable)),
            paths: Arc::new(SimulatedPathProbe::new()),
            clock,
            config,
        }
    }

    /// Healthy bench: links up after 5s, peer reachable.
    pub fn healthy(present: &[&str]) -> Self {
        Self::new(present, Some(Duration::from_secs(5)), true)
    }

    pub fn inject(&self, id: &str, fault: SimulatedFault) {
        self.control.inject_fault(id, fault);
    }

    pub fn orchestrator(&self) -> LifecycleOrchestrator {
        let suite = RecoverySuite::from_config(
            &self.config,
            self.control.clone(),
            self.link.clone(),
            self.reach.clone(),
            self.paths.clone(),
        );
        LifecycleOrchestrator::new(
            self.control.clone(),
            suite,
            PollWaiter::new(self.clock.clone()),
            OrchestratorConfig::from_config(&self.config),
        )
    }

    pub fn run(&self, resources: &[Resource], strategy: OrderingStrategy) -> RunReport {
        self.orchestrator().run(resources, strategy)
    }
}

/// Resource record for a descriptor, without sysfs.
pub fn resource(descriptor: &str, class: DeviceClass) -> Resource {
    simulated_resource(&descriptor.parse().unwrap(), class)
}

/// CPU threads `first..first+threads`, grouped under `core`.
pub fn core(core: u32, first: u32, threads: u32) -> Vec<Resource> {
    (first..first + threads)
        .map(|index| {
            let mut cpu = resource(&format!("cpu{index}"), DeviceClass::Generic);
            cpu.group = Some(core);
            cpu
        })
        .collect()
}

pub fn stuck_absent() -> SimulatedFault {
    SimulatedFault {
        stuck_absent: true,
        ..SimulatedFault::default()
    }
}

pub fn write_fails() -> SimulatedFault {
    SimulatedFault {
        write_fails: true,
        ..SimulatedFault::default()
    }
}
