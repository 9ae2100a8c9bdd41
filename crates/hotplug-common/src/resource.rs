//! Resource data model.
//!
//! A [`Resource`] is resolved once at setup and stays immutable for the whole
//! run. Its [`DeviceClass`] decides which recovery check runs after re-add;
//! nothing downstream looks at kernel class strings again.

use crate::error::HotplugError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device class of a hot-pluggable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Network adapter; recovery means link up and peer reachable.
    Network,
    /// Fibre channel / multipath storage adapter; every path must be active.
    StorageMultipath,
    /// Anything else; recovery means the resource is present again.
    Generic,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::StorageMultipath => write!(f, "storage_multipath"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// A resolved hot-pluggable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Stable identifier as reported by presence enumeration
    /// (`0001:00:00.0`, `cpu3`).
    pub id: String,
    /// Device class, fixed at resolution time.
    pub class: DeviceClass,
    /// Control attribute written to request removal or addition.
    pub control_path: String,
    /// Human-readable name for logs and reports.
    pub display_name: String,
    /// Ordering group (the core id for CPU threads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.display_name == self.id {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.id, self.display_name)
        }
    }
}

/// PCI address in domain:bus:device.function form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// PCI domain (segment).
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Slot address as written in `/sys/bus/pci/slots/*/address`
    /// (`DDDD:BB:DD`, no function).
    #[must_use]
    pub fn slot_address(&self) -> String {
        format!("{:04x}:{:02x}:{:02x}", self.domain, self.bus, self.device)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = HotplugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| HotplugError::unresolved(s, reason);

        let (head, function) = s
            .rsplit_once('.')
            .ok_or_else(|| bad("missing '.function' in PCI address"))?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [domain, bus, device] => (*domain, *bus, *device),
            [bus, device] => ("0", *bus, *device),
            _ => return Err(bad("expected [domain:]bus:device.function")),
        };

        // from_str_radix alone would accept a leading '+'
        let hex = |field: &str, what: &str| {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad(what));
            }
            u16::from_str_radix(field, 16).map_err(|_| bad(what))
        };
        let narrow = |value: u16, what: &str| u8::try_from(value).map_err(|_| bad(what));

        let domain = hex(domain, "invalid PCI domain")?;
        let bus = narrow(hex(bus, "invalid PCI bus")?, "invalid PCI bus")?;
        let device = narrow(hex(device, "invalid PCI device")?, "invalid PCI device")?;
        let function = hex(function, "invalid PCI function")?;
        let function = narrow(function, "invalid PCI function")?;

        if device > 0x1f {
            return Err(bad("PCI device number out of range"));
        }
        if function > 7 {
            return Err(bad("PCI function number out of range"));
        }

        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

/// Caller-supplied description of what to exercise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceDescriptor {
    /// A PCI adapter, hot-plugged through its slot power attribute.
    Pci(PciAddress),
    /// A single logical CPU.
    Cpu(u32),
    /// Every thread of a physical core.
    Core(u32),
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci(addr) => write!(f, "{addr}"),
            Self::Cpu(n) => write!(f, "cpu{n}"),
            Self::Core(n) => write!(f, "core:{n}"),
        }
    }
}

impl FromStr for ResourceDescriptor {
    type Err = HotplugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let is_index =
            |digits: &str| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
        let index = |digits: &str| {
            if !is_index(digits) {
                return Err(HotplugError::unresolved(s, "invalid index"));
            }
            digits
                .parse::<u32>()
                .map_err(|_| HotplugError::unresolved(s, "invalid index"))
        };

        if is_index(s) {
            return Ok(Self::Cpu(index(s)?));
        }
        if let Some(rest) = s.strip_prefix("core:") {
            return Ok(Self::Core(index(rest)?));
        }
        if let Some(rest) = s.strip_prefix("cpu:").or_else(|| s.strip_prefix("cpu")) {
            return Ok(Self::Cpu(index(rest)?));
        }
        s.parse().map(Self::Pci)
    }
}
