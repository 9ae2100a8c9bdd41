//! Recovery probes.
//!
//! Presence alone does not prove an adapter works again. These probes give
//! the recovery verifiers something functional to look at:
//!
//! - [`LinkProbe`]: is any network interface of the adapter up?
//! - [`ReachabilityProbe`]: does a peer answer through that adapter?
//! - [`PathProbe`]: which disk paths hang off the adapter, and what state
//!   does the multipath daemon report for each?

use crate::control::SysfsPaths;
use hotplug_common::{HotplugError, HotplugResult, Resource};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, trace};

/// Maximum directory depth searched for block devices below an adapter.
const BLOCK_SEARCH_DEPTH: usize = 8;

/// Reports network link state for a resource.
pub trait LinkProbe: Send + Sync {
    /// True when the resource has carrier.
    fn link_up(&self, resource: &Resource) -> HotplugResult<bool>;
}

/// Checks that a peer is reachable through a resource.
pub trait ReachabilityProbe: Send + Sync {
    /// Send one probe to `peer`, waiting at most `timeout` for the answer.
    fn probe(&self, resource: &Resource, peer: IpAddr, timeout: Duration) -> HotplugResult<bool>;
}

/// Multipath path state as reported by the path checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathState {
    /// Device-mapper state (`active`, `failed`).
    pub dm_state: String,
    /// Path checker state (`ready`, `faulty`, `ghost`).
    pub checker_state: String,
}

impl PathState {
    /// Build a state from its two components.
    pub fn new(dm_state: impl Into<String>, checker_state: impl Into<String>) -> Self {
        Self {
            dm_state: dm_state.into(),
            checker_state: checker_state.into(),
        }
    }

    /// The only state that counts as recovered.
    #[must_use]
    pub fn is_active_ready(&self) -> bool {
        self.dm_state == "active" && self.checker_state == "ready"
    }
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dm_state, self.checker_state)
    }
}

/// Enumerates disk paths and their state.
pub trait PathProbe: Send + Sync {
    /// Disk paths (`sda`, `sdb`) attached to `resource`.
    fn paths(&self, resource: &Resource) -> HotplugResult<Vec<String>>;

    /// Current state of `path`; `None` if the checker does not know it.
    fn path_state(&self, path: &str) -> HotplugResult<Option<PathState>>;
}

/// Network interface names bound to a PCI device.
pub fn pci_interfaces(paths: &SysfsPaths, bdf: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(paths.pci_device(bdf).join("net"))
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Link state from `net/<iface>/operstate`.
#[derive(Debug, Clone, Default)]
pub struct SysfsLinkProbe {
    paths: SysfsPaths,
}

impl SysfsLinkProbe {
    /// Probe rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SysfsPaths::new(root),
        }
    }
}

impl LinkProbe for SysfsLinkProbe {
    fn link_up(&self, resource: &Resource) -> HotplugResult<bool> {
        let interfaces = pci_interfaces(&self.paths, &resource.id);
        if interfaces.is_empty() {
            // Driver not bound yet
            return Ok(false);
        }

        let net = self.paths.pci_device(&resource.id).join("net");
        for iface in &interfaces {
            let state = fs::read_to_string(net.join(iface).join("operstate")).unwrap_or_default();
            trace!(resource = %resource.id, %iface, state = state.trim(), "Link state");
            if state.trim() == "up" {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProbe {
    paths: SysfsPaths,
    program: PathBuf,
}

impl PingProbe {
    /// Probe rooted at `root`, using `ping` from `PATH`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SysfsPaths::new(root),
            program: PathBuf::from("ping"),
        }
    }

    /// Use a specific ping binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl ReachabilityProbe for PingProbe {
    fn probe(&self, resource: &Resource, peer: IpAddr, timeout: Duration) -> HotplugResult<bool> {
        let wait_secs = timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.program);
        if peer.is_ipv6() {
            cmd.arg("-6");
        }
        let wait_secs = wait_secs.to_string();
        cmd.args(["-c", "1", "-W", wait_secs.as_str()]);
        if let Some(iface) = pci_interfaces(&self.paths, &resource.id).first() {
            cmd.args(["-I", iface.as_str()]);
        }
        cmd.arg(peer.to_string());

        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| cannot_run(&self.program, &e))?;

        debug!(resource = %resource.id, %peer, success = status.success(), "Ping probe");
        Ok(status.success())
    }
}

/// Paths from sysfs, states from `multipathd show paths`.
#[derive(Debug, Clone)]
pub struct MultipathdProbe {
    paths: SysfsPaths,
    program: PathBuf,
}

impl MultipathdProbe {
    /// Probe rooted at `root`, using `multipathd` from `PATH`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SysfsPaths::new(root),
            program: PathBuf::from("multipathd"),
        }
    }

    /// Use a specific multipathd binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl PathProbe for MultipathdProbe {
    fn paths(&self, resource: &Resource) -> HotplugResult<Vec<String>> {
        let device = self.paths.pci_device(&resource.id);
        let mut found = Vec::new();
        collect_block_devices(&device, 0, &mut found);
        found.sort();
        found.dedup();
        Ok(found)
    }

    fn path_state(&self, path: &str) -> HotplugResult<Option<PathState>> {
        let output = Command::new(&self.program)
            .args(["show", "paths", "format", "%d %t %T"])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| cannot_run(&self.program, &e))?;

        if !output.status.success() {
            return Err(HotplugError::Probe(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }

        let table = parse_multipath_paths(&String::from_utf8_lossy(&output.stdout));
        Ok(table.get(path).cloned())
    }
}

/// Parse `multipathd show paths format "%d %t %T"` output.
///
/// The first line is a header (`dev dm_st chk_st`) and is skipped.
pub fn parse_multipath_paths(output: &str) -> BTreeMap<String, PathState> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let dev = cols.next()?;
            let dm = cols.next()?;
            let chk = cols.next()?;
            (dev != "dev").then(|| (dev.to_string(), PathState::new(dm, chk)))
        })
        .collect()
}

fn cannot_run(program: &Path, err: &std::io::Error) -> HotplugError {
    HotplugError::Probe(format!("cannot run {}: {err}", program.display()))
}

/// Collect `block/<name>` entries below `dir` without following symlinks.
fn collect_block_devices(dir: &Path, depth: usize, found: &mut Vec<String>) {
    if depth > BLOCK_SEARCH_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        if entry.file_name() == "block" {
            if let Ok(blocks) = fs::read_dir(entry.path()) {
                let names = blocks
                    .flatten()
                    .map(|b| b.file_name().to_string_lossy().into_owned());
                found.extend(names);
            }
        } else {
            collect_block_devices(&entry.path(), depth + 1, found);
        }
    }
}
