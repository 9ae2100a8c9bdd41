//! Resolution of resource descriptors into [`Resource`] records.
//!
//! Resolution happens once, before any cycle runs. A descriptor that cannot
//! be mapped to a control attribute is a configuration error: it is reported
//! and excluded, never retried.
//!
//! PCI adapters are controlled through their hot-plug slot. The slot is found
//! from the device-tree location code (`devspec` → `ibm,loc-code`) and, when
//! no device tree exists, from the slot whose `address` matches the device.

use crate::control::SysfsPaths;
use crate::ordering::{generate_order, OrderingStrategy};
use hotplug_common::{
    DeviceClass, HotplugError, HotplugResult, PciAddress, Resource, ResourceDescriptor,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// PCI base class for network controllers.
const PCI_CLASS_NETWORK: u32 = 0x02;
/// PCI class/subclass for fibre channel controllers.
const PCI_CLASS_FIBRE_CHANNEL: u32 = 0x0c04;

/// A descriptor dropped from the run at setup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedResource {
    /// Descriptor as supplied.
    pub descriptor: String,
    /// Resolution failure.
    pub reason: String,
}

/// Outcome of resolving a batch of descriptors.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Successfully resolved resources, in input order.
    pub resources: Vec<Resource>,
    /// Descriptors that could not be resolved.
    pub excluded: Vec<ExcludedResource>,
}

impl Resolution {
    /// True when every descriptor resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.excluded.is_empty()
    }
}

/// Maps descriptors onto sysfs control attributes.
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    paths: SysfsPaths,
}

impl AddressRegistry {
    /// Create a registry reading sysfs under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SysfsPaths::new(root),
        }
    }

    /// Resolve a single-resource descriptor.
    ///
    /// `core:N` descriptors expand to several resources; use
    /// [`resolve_all`](Self::resolve_all) for those.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::UnresolvedResource`] when no control attribute
    /// can be found.
    pub fn resolve(&self, descriptor: &ResourceDescriptor) -> HotplugResult<Resource> {
        match descriptor {
            ResourceDescriptor::Pci(addr) => self.resolve_pci(addr),
            ResourceDescriptor::Cpu(index) => self.resolve_cpu(*index),
            ResourceDescriptor::Core(_) => Err(HotplugError::unresolved(
                descriptor.to_string(),
                "core descriptors expand to several CPUs",
            )),
        }
    }

    /// Parse and resolve one textual descriptor, expanding cores.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::UnresolvedResource`] for unparsable or
    /// unresolvable descriptors.
    pub fn resolve_str(&self, descriptor: &str) -> HotplugResult<Vec<Resource>> {
        match descriptor.parse::<ResourceDescriptor>()? {
            ResourceDescriptor::Core(core) => self.resolve_core(core),
            other => self.resolve(&other).map(|r| vec![r]),
        }
    }

    /// Resolve every descriptor, separating failures from successes.
    pub fn resolve_all<S: AsRef<str>>(&self, descriptors: &[S]) -> Resolution {
        let mut resolution = Resolution::default();

        for descriptor in descriptors {
            let descriptor = descriptor.as_ref();
            match self.resolve_str(descriptor) {
                Ok(resources) => {
                    for resource in resources {
                        if resolution.resources.iter().any(|r| r.id == resource.id) {
                            warn!(resource = %resource.id, "Duplicate resource ignored");
                            continue;
                        }
                        info!(
                            resource = %resource.id,
                            class = %resource.class,
                            control = %resource.control_path,
                            "Resolved resource"
                        );
                        resolution.resources.push(resource);
                    }
                }
                Err(e) => {
                    warn!(%descriptor, error = %e, "Excluding unresolvable resource");
                    resolution.excluded.push(ExcludedResource {
                        descriptor: descriptor.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        resolution
    }

    /// Produce one round of the iteration order for `resources`.
    pub fn generate_order(
        &self,
        resources: &[Resource],
        strategy: OrderingStrategy,
    ) -> Vec<Resource> {
        generate_order(resources, strategy)
    }

    fn resolve_pci(&self, addr: &PciAddress) -> HotplugResult<Resource> {
        let bdf = addr.to_string();
        let device = self.paths.pci_device(&bdf);
        if !device.is_dir() {
            return Err(HotplugError::unresolved(&bdf, "PCI device does not exist"));
        }

        let slot = self.find_slot(addr, &device)?;
        let power = self.paths.pci_slots().join(&slot).join("power");
        if !power.exists() {
            return Err(HotplugError::unresolved(
                &bdf,
                format!("slot {slot} does not support hotplug"),
            ));
        }

        let class = classify_pci(&device);
        debug!(%bdf, %slot, %class, "Classified PCI device");

        Ok(Resource {
            id: bdf,
            class,
            control_path: power.display().to_string(),
            display_name: slot,
            group: None,
        })
    }

    fn find_slot(&self, addr: &PciAddress, device: &Path) -> HotplugResult<String> {
        let bdf = addr.to_string();

        if let Ok(devspec) = fs::read_to_string(device.join("devspec")) {
            let devspec = devspec.trim().trim_start_matches('/');
            let loc_file = self.paths.device_tree().join(devspec).join("ibm,loc-code");
            if let Ok(loc) = fs::read_to_string(&loc_file) {
                let slot = slot_from_loc_code(&loc).ok_or_else(|| {
                    let reason = format!("unrecognised location code '{}'", clean(&loc));
                    HotplugError::unresolved(&bdf, reason)
                })?;
                if !self.paths.pci_slots().join(&slot).is_dir() {
                    let reason = format!("slot {slot} not available");
                    return Err(HotplugError::unresolved(&bdf, reason));
                }
                return Ok(slot);
            }
        }

        // No device tree: match the slot's bus address
        let wanted = addr.slot_address();
        if let Ok(entries) = fs::read_dir(self.paths.pci_slots()) {
            for entry in entries.flatten() {
                let address = fs::read_to_string(entry.path().join("address")).unwrap_or_default();
                if address.trim() == wanted {
                    return Ok(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }

        Err(HotplugError::unresolved(bdf, "no hotplug slot maps to this device"))
    }

    fn resolve_cpu(&self, index: u32) -> HotplugResult<Resource> {
        let name = format!("cpu{index}");
        let dir = self.paths.cpu(index);

        if let Ok(present) = fs::read_to_string(self.paths.cpus().join("present")) {
            let present = crate::control::parse_cpu_list(&present)
                .map_err(|e| HotplugError::unresolved(&name, e.to_string()))?;
            if !present.contains(&index) {
                return Err(HotplugError::unresolved(&name, "CPU index out of range"));
            }
        }
        if !dir.is_dir() {
            return Err(HotplugError::unresolved(&name, "CPU index out of range"));
        }

        let online = dir.join("online");
        if !online.exists() {
            return Err(HotplugError::unresolved(&name, "CPU has no online control"));
        }

        let group = read_u32(&dir.join("topology/core_id"));

        Ok(Resource {
            id: name.clone(),
            class: DeviceClass::Generic,
            control_path: online.display().to_string(),
            display_name: name,
            group,
        })
    }

    fn resolve_core(&self, core: u32) -> HotplugResult<Vec<Resource>> {
        let descriptor = format!("core:{core}");
        let entries = fs::read_dir(self.paths.cpus())
            .map_err(|e| HotplugError::unresolved(&descriptor, format!("cannot list CPUs: {e}")))?;

        let mut indices: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("cpu")?.parse::<u32>().ok()
            })
            .filter(|&index| {
                read_u32(&self.paths.cpu(index).join("topology/core_id")) == Some(core)
            })
            .collect();
        indices.sort_unstable();

        let threads: Vec<Resource> = indices
            .into_iter()
            .filter_map(|index| match self.resolve_cpu(index) {
                Ok(resource) => Some(resource),
                Err(e) => {
                    debug!(cpu = index, error = %e, "Skipping thread without hotplug control");
                    None
                }
            })
            .collect();

        if threads.is_empty() {
            return Err(HotplugError::unresolved(descriptor, "no hot-pluggable CPUs in core"));
        }
        Ok(threads)
    }
}

/// Classify a PCI device from its sysfs directory.
///
/// A `net/` child means a bound network driver; an `fc_host` under any SCSI
/// host means fibre channel storage. Otherwise fall back to the class code.
pub fn classify_pci(device: &Path) -> DeviceClass {
    if device.join("net").is_dir() {
        return DeviceClass::Network;
    }

    if let Ok(entries) = fs::read_dir(device) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("host") && entry.path().join("fc_host").is_dir() {
                return DeviceClass::StorageMultipath;
            }
        }
    }

    let code = fs::read_to_string(device.join("class"))
        .ok()
        .and_then(|c| u32::from_str_radix(c.trim().trim_start_matches("0x"), 16).ok());
    match code {
        Some(code) if code >> 16 == PCI_CLASS_NETWORK => DeviceClass::Network,
        Some(code) if code >> 8 == PCI_CLASS_FIBRE_CHANNEL => DeviceClass::StorageMultipath,
        _ => DeviceClass::Generic,
    }
}

/// Extract the hot-plug slot name from a device-tree location code.
///
/// Accepts `<unit>.<model>.<serial>-P<n>-C<n>[-...]` (the slot is everything
/// up to the connector number) and `Slot<n>`.
pub fn slot_from_loc_code(loc: &str) -> Option<String> {
    let loc = clean(loc);

    if let Some(rest) = loc.strip_prefix("Slot") {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        return (!digits.is_empty()).then(|| format!("Slot{digits}"));
    }

    let p = loc.find("-P")?;
    let unit = &loc[..p];
    if !unit.contains('.') || unit.split('.').any(str::is_empty) {
        return None;
    }

    let after_p = &loc[p + 2..];
    let p_digits = after_p.chars().take_while(char::is_ascii_digit).count();
    if p_digits == 0 || !after_p[p_digits..].starts_with("-C") {
        return None;
    }

    let after_c = &after_p[p_digits + 2..];
    let c_digits = after_c.chars().take_while(char::is_ascii_digit).count();
    if c_digits == 0 {
        return None;
    }

    let end = p + 2 + p_digits + 2 + c_digits;
    Some(loc[..end].to_string())
}

fn clean(s: &str) -> &str {
    s.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

fn read_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
