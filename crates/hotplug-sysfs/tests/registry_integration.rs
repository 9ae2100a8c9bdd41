//! Resolution and control tests against a fake sysfs tree.
//!
//! The tree is built under a temporary root with the same layout the kernel
//! exposes:
//! - `sys/bus/pci/devices/<bdf>` with `class`, `devspec`, `net/`, `host*/fc_host`
//! - `sys/bus/pci/slots/<slot>/{power,address}`
//! - `proc/device-tree/<devspec>/ibm,loc-code`
//! - `sys/devices/system/cpu/{present,online,cpuN/online,cpuN/topology/core_id}`

use hotplug_common::{DeviceClass, HotplugError, ResourceDescriptor};
use hotplug_sysfs::{
    AddressRegistry, OrderingStrategy, ResourceControl, SysfsControl, SysfsPaths, DISABLE_VALUE,
    ENABLE_VALUE,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

struct FakeSysfs {
    dir: TempDir,
    paths: SysfsPaths,
}

impl FakeSysfs {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = SysfsPaths::new(dir.path());
        fs::create_dir_all(paths.pci_devices()).unwrap();
        fs::create_dir_all(paths.pci_slots()).unwrap();
        fs::create_dir_all(paths.cpus()).unwrap();
        Self { dir, paths }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// PCI device located through the device tree.
    fn pci_with_loc_code(&self, bdf: &str, class: &str, node: &str, loc: &str) {
        let device = self.paths.pci_device(bdf);
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("class"), format!("{class}\n")).unwrap();
        fs::write(device.join("devspec"), format!("/{node}\n")).unwrap();

        let node_dir = self.paths.device_tree().join(node);
        fs::create_dir_all(&node_dir).unwrap();
        fs::write(node_dir.join("ibm,loc-code"), format!("{loc}\0")).unwrap();
    }

    /// PCI device located through the slot `address` file.
    fn pci_with_address(&self, bdf: &str, class: &str) {
        let device = self.paths.pci_device(bdf);
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("class"), format!("{class}\n")).unwrap();
    }

    fn slot(&self, name: &str, address: Option<&str>, hotplug: bool) {
        let slot = self.paths.pci_slots().join(name);
        fs::create_dir_all(&slot).unwrap();
        if hotplug {
            fs::write(slot.join("power"), "1\n").unwrap();
        }
        if let Some(address) = address {
            fs::write(slot.join("address"), format!("{address}\n")).unwrap();
        }
    }

    fn cpus(&self, present: &str, online: &str) {
        fs::write(self.paths.cpus().join("present"), format!("{present}\n")).unwrap();
        fs::write(self.paths.cpus().join("online"), format!("{online}\n")).unwrap();
    }

    fn cpu(&self, index: u32, core: u32, hotplug: bool) {
        let dir = self.paths.cpu(index);
        fs::create_dir_all(dir.join("topology")).unwrap();
        fs::write(dir.join("topology/core_id"), format!("{core}\n")).unwrap();
        if hotplug {
            fs::write(dir.join("online"), "1\n").unwrap();
        }
    }

    /// Two SMT-4 cores; cpu0 is the boot CPU without an `online` attribute.
    fn smt4(&self) {
        self.cpus("0-7", "0-7");
        for index in 0..8 {
            self.cpu(index, index / 4, index != 0);
        }
    }
}

fn unresolved_reason(err: &HotplugError) -> &str {
    match err {
        HotplugError::UnresolvedResource { reason, .. } => reason,
        other => panic!("expected UnresolvedResource, got {other:?}"),
    }
}

// ============================================================================
// PCI resolution
// ============================================================================

#[test]
fn test_pci_resolves_through_location_code() {
    let fake = FakeSysfs::new();
    fake.pci_with_loc_code(
        "0001:00:00.0",
        "0x020000",
        "pci@800000020000001/ethernet@0",
        "U78C9.001.WZS0CWX-P1-C6-T1",
    );
    fake.slot("U78C9.001.WZS0CWX-P1-C6", None, true);

    let registry = AddressRegistry::new(fake.root());
    let resource = registry.resolve(&"0001:00:00.0".parse().unwrap()).unwrap();

    assert_eq!(resource.id, "0001:00:00.0");
    assert_eq!(resource.class, DeviceClass::Network);
    assert_eq!(resource.display_name, "U78C9.001.WZS0CWX-P1-C6");
    assert!(resource.control_path.ends_with("slots/U78C9.001.WZS0CWX-P1-C6/power"));
}

#[test]
fn test_pci_falls_back_to_slot_address() {
    let fake = FakeSysfs::new();
    fake.pci_with_address("0002:01:00.0", "0x0c0400");
    fake.slot("Slot3", Some("0002:01:00"), true);
    fake.slot("Slot4", Some("0002:02:00"), true);

    let registry = AddressRegistry::new(fake.root());
    let resource = registry.resolve(&"0002:01:00.0".parse().unwrap()).unwrap();

    assert_eq!(resource.class, DeviceClass::StorageMultipath);
    assert_eq!(resource.display_name, "Slot3");
}

#[test]
fn test_functions_of_one_slot_share_control_path() {
    let fake = FakeSysfs::new();
    fake.pci_with_address("0001:00:00.0", "0x020000");
    fake.pci_with_address("0001:00:00.1", "0x020000");
    fake.slot("Slot1", Some("0001:00:00"), true);

    let registry = AddressRegistry::new(fake.root());
    let resolution = registry.resolve_all(&["0001:00:00.0", "0001:00:00.1"]);

    assert!(resolution.is_complete());
    assert_eq!(resolution.resources.len(), 2);
    assert_eq!(
        resolution.resources[0].control_path,
        resolution.resources[1].control_path
    );
    assert!(resolution.resources[0].control_path.ends_with("Slot1/power"));
}

#[test]
fn test_short_bdf_defaults_domain() {
    let fake = FakeSysfs::new();
    fake.pci_with_address("0000:05:00.1", "0x010802");
    fake.slot("Slot1", Some("0000:05:00"), true);

    let resources = AddressRegistry::new(fake.root()).resolve_str("05:00.1").unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].id, "0000:05:00.1");
    assert_eq!(resources[0].class, DeviceClass::Generic);
}

#[test]
fn test_pci_resolution_failures() {
    let fake = FakeSysfs::new();
    let registry = AddressRegistry::new(fake.root());

    // No such device
    let err = registry.resolve(&"0003:00:00.0".parse().unwrap()).unwrap_err();
    assert!(unresolved_reason(&err).contains("does not exist"));

    // Device without any slot
    fake.pci_with_address("0004:00:00.0", "0x020000");
    let err = registry.resolve(&"0004:00:00.0".parse().unwrap()).unwrap_err();
    assert!(unresolved_reason(&err).contains("no hotplug slot"));

    // Slot without power control
    fake.slot("Slot9", Some("0004:00:00"), false);
    let err = registry.resolve(&"0004:00:00.0".parse().unwrap()).unwrap_err();
    assert!(unresolved_reason(&err).contains("does not support hotplug"));
}

// ============================================================================
// CPU resolution
// ============================================================================

#[test]
fn test_cpu_resolution() {
    let fake = FakeSysfs::new();
    fake.smt4();
    let registry = AddressRegistry::new(fake.root());

    let cpu5 = registry.resolve(&ResourceDescriptor::Cpu(5)).unwrap();
    assert_eq!(cpu5.id, "cpu5");
    assert_eq!(cpu5.class, DeviceClass::Generic);
    assert_eq!(cpu5.group, Some(1));
    assert!(cpu5.control_path.ends_with("cpu5/online"));

    let err = registry.resolve(&ResourceDescriptor::Cpu(64)).unwrap_err();
    assert!(unresolved_reason(&err).contains("out of range"));

    let err = registry.resolve(&ResourceDescriptor::Cpu(0)).unwrap_err();
    assert!(unresolved_reason(&err).contains("no online control"));
}

#[test]
fn test_core_expands_to_hotpluggable_threads() {
    let fake = FakeSysfs::new();
    fake.smt4();
    let registry = AddressRegistry::new(fake.root());

    let core0: Vec<String> = registry
        .resolve_str("core:0")
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(core0, vec!["cpu1", "cpu2", "cpu3"]);

    let core1 = registry.resolve_str("core:1").unwrap();
    assert_eq!(core1.len(), 4);
    assert!(core1.iter().all(|r| r.group == Some(1)));

    assert!(registry.resolve_str("core:9").is_err());
}

#[test]
fn test_resolve_all_excludes_and_dedups() {
    let fake = FakeSysfs::new();
    fake.smt4();
    let registry = AddressRegistry::new(fake.root());

    let resolution = registry.resolve_all(&["cpu4", "core:1", "cpu99", "garbage", "cpu:6"]);

    let ids: Vec<&str> = resolution.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["cpu4", "cpu5", "cpu6", "cpu7"]);
    assert!(!resolution.is_complete());
    let excluded: Vec<&str> = resolution.excluded.iter().map(|e| e.descriptor.as_str()).collect();
    assert_eq!(excluded, vec!["cpu99", "garbage"]);
}

#[test]
fn test_random_order_keeps_core_threads_together() {
    let fake = FakeSysfs::new();
    fake.smt4();
    let registry = AddressRegistry::new(fake.root());
    let resolution = registry.resolve_all(&["core:0", "core:1"]);

    let order = registry.generate_order(&resolution.resources, OrderingStrategy::SeededRandom(3));
    assert_eq!(order.len(), 7);
    let first_core = order[0].group;
    let run = order.iter().take_while(|r| r.group == first_core).count();
    assert_eq!(run, if first_core == Some(0) { 3 } else { 4 });

    let same = registry.generate_order(&resolution.resources, OrderingStrategy::SeededRandom(3));
    assert_eq!(order, same);
}

// ============================================================================
// Control writes and enumeration
// ============================================================================

#[test]
fn test_control_writes_and_presence() {
    let fake = FakeSysfs::new();
    fake.smt4();
    fake.pci_with_address("0001:00:00.0", "0x020000");
    fake.slot("Slot1", Some("0001:00:00"), true);

    let registry = AddressRegistry::new(fake.root());
    let cpu3 = registry.resolve(&ResourceDescriptor::Cpu(3)).unwrap();
    let nic = registry.resolve(&"0001:00:00.0".parse().unwrap()).unwrap();
    let control = SysfsControl::new(fake.root());

    control.request_remove(&cpu3).unwrap();
    assert_eq!(fs::read_to_string(&cpu3.control_path).unwrap(), DISABLE_VALUE);
    control.request_add(&nic).unwrap();
    assert_eq!(fs::read_to_string(&nic.control_path).unwrap(), ENABLE_VALUE);

    // The kernel would update `online`; do it by hand
    fs::write(fake.paths.cpus().join("online"), "0-2,4-7\n").unwrap();
    let present = control.list_present().unwrap();
    assert!(present.contains("0001:00:00.0"));
    assert!(present.contains("cpu2"));
    assert!(!control.is_present(&cpu3).unwrap());
}

#[test]
fn test_missing_control_attribute_is_fatal() {
    let fake = FakeSysfs::new();
    fake.smt4();
    let registry = AddressRegistry::new(fake.root());
    let cpu2 = registry.resolve(&ResourceDescriptor::Cpu(2)).unwrap();
    fs::remove_file(&cpu2.control_path).unwrap();

    let err = SysfsControl::new(fake.root()).request_remove(&cpu2).unwrap_err();
    assert!(matches!(err, HotplugError::FatalIo { .. }));
    assert!(!Path::new(&cpu2.control_path).exists());
}
