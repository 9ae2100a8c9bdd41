//! Sysfs-backed resource control.
//!
//! Removal and addition are requested by writing `0`/`1` to a control
//! attribute resolved by the registry: a PCI slot's `power` file or a CPU's
//! `online` file. Presence is read from the PCI device directory and the
//! kernel's online CPU list.

use crate::{ResourceControl, DISABLE_VALUE, ENABLE_VALUE};
use hotplug_common::{HotplugError, HotplugResult, Resource};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Well-known locations under a sysfs/procfs root.
#[derive(Debug, Clone)]
pub struct SysfsPaths {
    root: PathBuf,
}

impl Default for SysfsPaths {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SysfsPaths {
    /// Paths relative to `root` (normally `/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/sys/bus/pci/devices`
    pub fn pci_devices(&self) -> PathBuf {
        self.root.join("sys/bus/pci/devices")
    }

    /// `/sys/bus/pci/devices/<bdf>`
    pub fn pci_device(&self, bdf: &str) -> PathBuf {
        self.pci_devices().join(bdf)
    }

    /// `/sys/bus/pci/slots`
    pub fn pci_slots(&self) -> PathBuf {
        self.root.join("sys/bus/pci/slots")
    }

    /// `/proc/device-tree`
    pub fn device_tree(&self) -> PathBuf {
        self.root.join("proc/device-tree")
    }

    /// `/sys/devices/system/cpu`
    pub fn cpus(&self) -> PathBuf {
        self.root.join("sys/devices/system/cpu")
    }

    /// `/sys/devices/system/cpu/cpu<n>`
    pub fn cpu(&self, index: u32) -> PathBuf {
        self.cpus().join(format!("cpu{index}"))
    }
}

/// Resource control through real sysfs attributes.
#[derive(Debug, Clone, Default)]
pub struct SysfsControl {
    paths: SysfsPaths,
}

impl SysfsControl {
    /// Create a control rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SysfsPaths::new(root),
        }
    }

    /// Underlying path layout.
    pub fn paths(&self) -> &SysfsPaths {
        &self.paths
    }

    fn write_control(&self, resource: &Resource, value: &str) -> HotplugResult<()> {
        let path = Path::new(&resource.control_path);
        debug!(
            resource = %resource.id,
            path = %path.display(),
            value = value.trim(),
            "Writing control attribute"
        );

        // No create(): a missing attribute must fail, not be fabricated
        let result = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut file| file.write_all(value.as_bytes()));

        result.map_err(|e| {
            error!(
                resource = %resource.id,
                path = %path.display(),
                error = %e,
                "Control write failed"
            );
            HotplugError::fatal_io(path, &e)
        })
    }

    fn present_pci_devices(&self, present: &mut BTreeSet<String>) -> HotplugResult<()> {
        let dir = self.paths.pci_devices();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(HotplugError::Probe(format!(
                    "cannot list {}: {e}",
                    dir.display()
                )))
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| HotplugError::Probe(e.to_string()))?;
            present.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(())
    }

    fn present_cpus(&self, present: &mut BTreeSet<String>) -> HotplugResult<()> {
        let online = self.paths.cpus().join("online");
        let list = match std::fs::read_to_string(&online) {
            Ok(list) => list,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(HotplugError::Probe(format!(
                    "cannot read {}: {e}",
                    online.display()
                )))
            }
        };

        for cpu in parse_cpu_list(&list)? {
            present.insert(format!("cpu{cpu}"));
        }
        Ok(())
    }
}

impl ResourceControl for SysfsControl {
    fn request_remove(&self, resource: &Resource) -> HotplugResult<()> {
        self.write_control(resource, DISABLE_VALUE)
    }

    fn request_add(&self, resource: &Resource) -> HotplugResult<()> {
        self.write_control(resource, ENABLE_VALUE)
    }

    fn list_present(&self) -> HotplugResult<BTreeSet<String>> {
        let mut present = BTreeSet::new();
        self.present_pci_devices(&mut present)?;
        self.present_cpus(&mut present)?;
        Ok(present)
    }
}

/// Parse a kernel CPU range list such as `0-3,8,10-11`.
///
/// # Errors
///
/// Returns [`HotplugError::Probe`] on malformed input.
pub fn parse_cpu_list(list: &str) -> HotplugResult<Vec<u32>> {
    let bad = || HotplugError::Probe(format!("malformed cpu list '{}'", list.trim()));
    let mut cpus = Vec::new();

    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| bad())?;
                let hi: u32 = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_common::DeviceClass;
    use std::fs;

    fn cpu_resource(path: &Path) -> Resource {
        Resource {
            id: "cpu1".into(),
            class: DeviceClass::Generic,
            control_path: path.display().to_string(),
            display_name: "cpu1".into(),
            group: None,
        }
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
        assert!(parse_cpu_list("").unwrap().is_empty());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn test_write_control_values() {
        let dir = tempfile::tempdir().unwrap();
        let online = dir.path().join("online");
        fs::write(&online, "1\n").unwrap();
        let control = SysfsControl::new(dir.path());
        let res = cpu_resource(&online);

        control.request_remove(&res).unwrap();
        assert_eq!(fs::read_to_string(&online).unwrap(), "0\n");
        control.request_add(&res).unwrap();
        assert_eq!(fs::read_to_string(&online).unwrap(), "1\n");
    }

    #[test]
    fn test_missing_control_is_fatal_io() {
        let dir = tempfile::tempdir().unwrap();
        let control = SysfsControl::new(dir.path());
        let res = cpu_resource(&dir.path().join("does-not-exist"));

        let err = control.request_remove(&res).unwrap_err();
        assert!(matches!(err, HotplugError::FatalIo { .. }));
        assert!(!dir.path().join("does-not-exist").exists());
    }

    #[test]
    fn test_list_present_merges_pci_and_cpus() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SysfsPaths::new(dir.path());
        fs::create_dir_all(paths.pci_device("0001:00:00.0")).unwrap();
        fs::create_dir_all(paths.pci_device("0002:01:00.1")).unwrap();
        fs::create_dir_all(paths.cpus()).unwrap();
        fs::write(paths.cpus().join("online"), "0-1,3\n").unwrap();

        let present = SysfsControl::new(dir.path()).list_present().unwrap();
        let expected: BTreeSet<String> = ["0001:00:00.0", "0002:01:00.1", "cpu0", "cpu1", "cpu3"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        assert_eq!(present, expected);
    }

    #[test]
    fn test_list_present_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SysfsControl::new(dir.path()).list_present().unwrap().is_empty());
    }
}
