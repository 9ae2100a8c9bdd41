//! CPU stress runs.
//!
//! # Acceptance Criteria
//!
//! - Every non-excluded resource gets exactly N cycles
//! - A randomized run is replayable from the recorded seed
//! - Threads of one core are cycled back to back
//! - A failed control write abandons only that resource
//! - The run budget stops new cycles and keeps the partial report

use super::common::{core, write_fails, TestBench};
use hotplug_common::{Resource, Stage};
use hotplug_runtime::RunReport;
use hotplug_sysfs::OrderingStrategy;
use std::time::Duration;

fn cpus(cores: u32) -> Vec<Resource> {
    (0..cores).flat_map(|c| core(c, c * 4, 4)).collect()
}

fn present_ids(resources: &[Resource]) -> Vec<String> {
    resources.iter().map(|r| r.id.clone()).collect()
}

fn bench_for(resources: &[Resource]) -> TestBench {
    let ids = present_ids(resources);
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    TestBench::healthy(&refs)
}

/// Resource order of the `Remove` stages in `iteration`.
fn removal_order(report: &RunReport, iteration: u32) -> Vec<String> {
    report
        .attempts
        .iter()
        .filter(|a| a.iteration == iteration && a.stage == Stage::Remove)
        .map(|a| a.resource.clone())
        .collect()
}

#[test]
fn test_exact_cycle_count() {
    let resources = cpus(4);
    let mut bench = bench_for(&resources);
    bench.config.iterations = 5;

    let report = bench.run(&resources, OrderingStrategy::SeededRandom(99));

    for cpu in &resources {
        assert_eq!(bench.control.remove_requests(&cpu.id), 5);
        assert_eq!(bench.control.add_requests(&cpu.id), 5);
    }
    assert_eq!(report.cycles_started(), 80);
    assert!(report.summary().passed());
}

#[test]
fn test_seed_replays_order() {
    let resources = cpus(4);
    let run = || {
        let mut bench = bench_for(&resources);
        bench.config.iterations = 3;
        bench.run(&resources, OrderingStrategy::SeededRandom(31337))
    };

    let first = run();
    let second = run();
    assert_eq!(first.seed, Some(31337));
    for iteration in 1..=3 {
        assert_eq!(removal_order(&first, iteration), removal_order(&second, iteration));
    }
    // A new permutation every round
    assert!((2..=3).any(|i| removal_order(&first, i) != removal_order(&first, 1)));
}

#[test]
fn test_core_threads_stay_together() {
    let resources = cpus(3);
    let mut bench = bench_for(&resources);
    bench.config.iterations = 4;

    let report = bench.run(&resources, OrderingStrategy::SeededRandom(5));

    for iteration in 1..=4 {
        let order = removal_order(&report, iteration);
        for chunk in order.chunks(4) {
            let group: Vec<_> = chunk
                .iter()
                .map(|id| resources.iter().find(|r| &r.id == id).and_then(|r| r.group))
                .collect();
            assert!(group.iter().all(|g| *g == group[0]), "{order:?}");
        }
    }
}

#[test]
fn test_write_failure_abandons_single_cpu() {
    let resources = cpus(1);
    let mut bench = bench_for(&resources);
    bench.config.iterations = 4;
    bench.inject("cpu2", write_fails());

    let report = bench.run(&resources, OrderingStrategy::Identity);

    assert_eq!(report.abandoned, vec!["cpu2"]);
    assert_eq!(report.attempts.iter().filter(|a| a.resource == "cpu2").count(), 1);
    assert_eq!(report.recovered_cycles(), 12);
    assert_eq!(report.summary().failed_resource_ids.len(), 1);
}

#[test]
fn test_budget_keeps_partial_report() {
    let resources = cpus(2);
    let mut bench = bench_for(&resources);
    bench.config.iterations = 1000;
    bench.config.run.budget = Some(Duration::from_secs(600));

    let report = bench.run(&resources, OrderingStrategy::SeededRandom(8));

    assert!(report.truncated);
    assert!(report.cycles_started() > 0);
    assert!(report.cycles_started() < 8000);
    assert!(report.summary().passed());
    assert!(report.to_string().ends_with("(run truncated)"));
    // The cycle in flight may finish its stage, nothing more
    assert!(bench.clock.elapsed() < Duration::from_secs(600 + 60));
}

#[test]
fn test_parallel_run_matches_sequential_totals() {
    let resources = cpus(2);
    let mut bench = bench_for(&resources);
    bench.config.iterations = 3;
    bench.config.run.parallel = true;
    bench.config.timeouts.remove = Duration::from_secs(3600);
    bench.config.timeouts.add = Duration::from_secs(3600);

    let report = bench.run(&resources, OrderingStrategy::Identity);

    assert_eq!(report.cycles_started(), 24);
    assert!(report.summary().passed());
    for cpu in &resources {
        assert_eq!(bench.control.remove_requests(&cpu.id), 3);
    }
}
