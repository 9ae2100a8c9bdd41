//! Configuration files and report output.

use super::common::{resource, stuck_absent, TestBench, PEER};
use hotplug_common::{DeviceClass, HotplugConfig, OrderingKind};
use hotplug_runtime::RunReport;
use hotplug_sysfs::OrderingStrategy;
use std::path::Path;
use std::time::Duration;

#[test]
fn test_example_config_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/hotplug.example.toml");
    let config = HotplugConfig::from_file(&path).unwrap();

    assert_eq!(config.iterations, 10);
    assert_eq!(config.resources.len(), 3);
    assert_eq!(config.ordering.strategy, OrderingKind::SeededRandom);
    assert_eq!(
        OrderingStrategy::from_config(&config.ordering),
        OrderingStrategy::SeededRandom(20_240_611)
    );
    assert_eq!(config.recovery.multipath.timeout, Duration::from_secs(120));
    assert_eq!(config.recovery.network.peer, Some(PEER.parse().unwrap()));
    assert_eq!(config.run.budget, Some(Duration::from_secs(4 * 3600)));
}

#[test]
fn test_config_file_written_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hotplug.toml");
    let mut config = HotplugConfig::default();
    config.iterations = 4;
    config.resources = vec!["cpu1".into()];
    config.timeouts.poll_interval = Duration::from_millis(250);
    std::fs::write(&path, config.to_toml().unwrap()).unwrap();

    let loaded = HotplugConfig::from_file(&path).unwrap();
    assert_eq!(loaded.iterations, 4);
    assert_eq!(loaded.resources, vec!["cpu1"]);
    assert_eq!(loaded.timeouts.poll_interval, Duration::from_millis(250));
}

#[test]
fn test_missing_config_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(HotplugConfig::from_file(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_report_json_round_trip() {
    let nic = "0001:00:00.0";
    let bench = TestBench::healthy(&[nic, "cpu1"]);
    bench.inject(nic, stuck_absent());
    let resources = [resource(nic, DeviceClass::Network), resource("cpu1", DeviceClass::Generic)];
    let report = bench.run(&resources, OrderingStrategy::SeededRandom(17));

    let json = serde_json::to_string_pretty(&report).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["seed"], 17);
    assert_eq!(value["truncated"], false);
    assert!(value["started_at"].as_str().unwrap().ends_with('Z'));
    let timed_out = value["attempts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["outcome"] == "timed_out")
        .unwrap();
    assert_eq!(timed_out["stage"], "VERIFY_PRESENT");
    assert_eq!(timed_out["resource"], nic);

    let back: RunReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.summary(), report.summary());
    assert_eq!(back.to_string(), format!("following devices failed: {nic}"));
}
