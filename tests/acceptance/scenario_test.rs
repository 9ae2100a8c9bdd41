//! Reference hot-plug scenarios.
//!
//! # Acceptance Criteria
//!
//! - A healthy network adapter passes every iteration, probing the peer only
//!   after the link is up
//! - An adapter that never reappears fails at `VERIFY_PRESENT` and is never
//!   handed to recovery
//! - A multipath adapter with one dead path fails naming only that path
//! - Failures never stop other resources or later iterations

use super::common::{resource, stuck_absent, TestBench};
use hotplug_common::{DeviceClass, Stage, StageOutcome};
use hotplug_sysfs::{OrderingStrategy, PathState};
use std::collections::BTreeSet;
use std::time::Duration;

const NIC: &str = "0001:00:00.0";
const HBA: &str = "0002:01:00.0";

#[test]
fn test_network_adapter_recovers_every_iteration() {
    let mut bench = TestBench::healthy(&[NIC]);
    bench.config.iterations = 2;

    let report = bench.run(&[resource(NIC, DeviceClass::Network)], OrderingStrategy::Identity);

    assert!(report.summary().failed_resource_ids.is_empty());
    assert_eq!(report.recovered_cycles(), 2);
    assert!(report.attempts.iter().all(|a| a.outcome == StageOutcome::Ok));
    assert_eq!(bench.reach.calls(), 2);

    // Each cycle honours the 45s settle floor before the first link poll
    assert!(bench.clock.elapsed() >= Duration::from_secs(2 * 45));
    for attempt in report.attempts.iter().filter(|a| a.stage == Stage::Recover) {
        let took = attempt.ended_at.duration_since(attempt.started_at).unwrap();
        assert!(took >= Duration::from_secs(5));
    }
}

#[test]
fn test_adapter_that_never_returns_skips_recovery() {
    let mut bench = TestBench::healthy(&[NIC]);
    bench.config.iterations = 2;
    bench.inject(NIC, stuck_absent());

    let report = bench.run(&[resource(NIC, DeviceClass::Network)], OrderingStrategy::Identity);

    let summary = report.summary();
    assert_eq!(summary.failed_resource_ids, BTreeSet::from([NIC.to_string()]));
    let timed_out: Vec<_> = report
        .attempts
        .iter()
        .filter(|a| a.outcome == StageOutcome::TimedOut)
        .map(|a| (a.iteration, a.stage))
        .collect();
    assert_eq!(timed_out, vec![(1, Stage::VerifyPresent), (2, Stage::VerifyPresent)]);
    assert!(report.attempts.iter().all(|a| a.stage != Stage::Recover));
    assert_eq!(bench.link.queries(), 0);
    assert_eq!(bench.reach.calls(), 0);
    assert_eq!(report.to_string(), format!("following devices failed: {NIC}"));
}

#[test]
fn test_one_dead_multipath_leg() {
    let bench = TestBench::healthy(&[HBA]);
    bench.paths.attach(HBA, &["sda", "sdb", "sdc"]);
    bench.paths.set_state("sdb", PathState::new("active", "faulty"));

    let hba = resource(HBA, DeviceClass::StorageMultipath);
    let report = bench.run(&[hba], OrderingStrategy::Identity);

    assert_eq!(report.recoveries.len(), 1);
    let outcome = &report.recoveries[0];
    assert!(!outcome.verified);
    assert_eq!(outcome.failing_detail.as_deref(), Some("sdb"));
    assert_eq!(bench.paths.enumerations(), 1);
}

#[test]
fn test_link_down_never_probes_peer() {
    let bench = TestBench::new(&[NIC], None, true);

    let report = bench.run(&[resource(NIC, DeviceClass::Network)], OrderingStrategy::Identity);

    assert_eq!(report.recoveries[0].failing_detail.as_deref(), Some("link-down"));
    assert_eq!(bench.reach.calls(), 0);
    assert!(bench.link.queries() > 1);
}

#[test]
fn test_failures_do_not_stop_other_resources() {
    let mut bench = TestBench::healthy(&[NIC, HBA, "cpu4"]);
    bench.config.iterations = 3;
    bench.inject(NIC, stuck_absent());
    bench.paths.attach(HBA, &["sda", "sdb"]);

    let resources = [
        resource(NIC, DeviceClass::Network),
        resource(HBA, DeviceClass::StorageMultipath),
        resource("cpu4", DeviceClass::Generic),
    ];
    let report = bench.run(&resources, OrderingStrategy::Identity);

    assert_eq!(report.summary().failed_resource_ids, BTreeSet::from([NIC.to_string()]));
    assert_eq!(report.recovered_cycles(), 6);
    for id in [NIC, HBA, "cpu4"] {
        assert_eq!(bench.control.remove_requests(id), 3);
    }
}
