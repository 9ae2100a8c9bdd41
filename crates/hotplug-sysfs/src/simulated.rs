//! In-memory control and probes for testing without hardware.
//!
//! The simulated kernel applies a removal or addition a configurable latency
//! after it was requested, measured on the injected [`Clock`]. Faults are
//! injected per resource: a removal that never completes, an addition that
//! never completes, or control writes that fail.

use crate::probe::{LinkProbe, PathProbe, PathState, ReachabilityProbe};
use crate::ResourceControl;
use hotplug_common::{
    Clock, DeviceClass, HotplugError, HotplugResult, Resource, ResourceDescriptor,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-resource fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedFault {
    /// Removal is accepted but the resource never disappears.
    pub stuck_present: bool,
    /// Addition is accepted but the resource never reappears.
    pub stuck_absent: bool,
    /// Every control write fails with a permission error.
    pub write_fails: bool,
    /// The next `failing_adds` addition requests fail with a permission
    /// error; removals are unaffected.
    pub failing_adds: u32,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Remove(Instant),
    Add(Instant),
}

#[derive(Debug, Default)]
struct SimState {
    present: BTreeSet<String>,
    pending: HashMap<String, Pending>,
    faults: HashMap<String, SimulatedFault>,
    removes: HashMap<String, u32>,
    adds: HashMap<String, u32>,
}

impl SimState {
    fn settle(&mut self, now: Instant) {
        let mut done = Vec::new();
        for (id, pending) in &self.pending {
            let fault = self.faults.get(id).copied().unwrap_or_default();
            match *pending {
                Pending::Remove(at) if now >= at && !fault.stuck_present => {
                    done.push((id.clone(), false));
                }
                Pending::Add(at) if now >= at && !fault.stuck_absent => {
                    done.push((id.clone(), true));
                }
                _ => {}
            }
        }
        for (id, present) in done {
            self.pending.remove(&id);
            if present {
                self.present.insert(id);
            } else {
                self.present.remove(&id);
            }
        }
    }
}

/// Simulated kernel control for a fixed set of resources.
#[derive(Debug)]
pub struct SimulatedControl {
    clock: Arc<dyn Clock>,
    remove_latency: Duration,
    add_latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedControl {
    /// Create a control where `present` resources start out visible.
    pub fn new<I, S>(clock: Arc<dyn Clock>, present: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = SimState {
            present: present.into_iter().map(Into::into).collect(),
            ..SimState::default()
        };
        Self {
            clock,
            remove_latency: Duration::from_secs(2),
            add_latency: Duration::from_secs(5),
            state: Mutex::new(state),
        }
    }

    /// Set how long removal and addition take to become visible.
    #[must_use]
    pub fn with_latency(mut self, remove: Duration, add: Duration) -> Self {
        self.remove_latency = remove;
        self.add_latency = add;
        self
    }

    /// Inject a fault for `id`.
    pub fn inject_fault(&self, id: &str, fault: SimulatedFault) {
        self.lock().faults.insert(id.to_string(), fault);
    }

    /// Number of removal requests accepted for `id`.
    pub fn remove_requests(&self, id: &str) -> u32 {
        self.lock().removes.get(id).copied().unwrap_or(0)
    }

    /// Number of addition requests accepted for `id`.
    pub fn add_requests(&self, id: &str) -> u32 {
        self.lock().adds.get(id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, resource: &Resource, add: bool) -> HotplugResult<()> {
        let mut state = self.lock();
        let fault = state.faults.get(&resource.id).copied().unwrap_or_default();
        let add_refused = add && fault.failing_adds > 0;
        if add_refused {
            if let Some(f) = state.faults.get_mut(&resource.id) {
                f.failing_adds -= 1;
            }
        }
        if fault.write_fails || add_refused {
            return Err(HotplugError::FatalIo {
                path: resource.control_path.clone(),
                reason: "Permission denied (os error 13)".into(),
            });
        }

        let now = self.clock.now();
        let (pending, counter) = if add {
            (Pending::Add(now + self.add_latency), &mut state.adds)
        } else {
            (Pending::Remove(now + self.remove_latency), &mut state.removes)
        };
        *counter.entry(resource.id.clone()).or_insert(0) += 1;
        state.pending.insert(resource.id.clone(), pending);
        Ok(())
    }
}

impl ResourceControl for SimulatedControl {
    fn request_remove(&self, resource: &Resource) -> HotplugResult<()> {
        self.request(resource, false)
    }

    fn request_add(&self, resource: &Resource) -> HotplugResult<()> {
        self.request(resource, true)
    }

    fn list_present(&self) -> HotplugResult<BTreeSet<String>> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.settle(now);
        Ok(state.present.clone())
    }
}

/// Build a resource record for a descriptor without touching sysfs.
pub fn simulated_resource(descriptor: &ResourceDescriptor, class: DeviceClass) -> Resource {
    let id = descriptor.to_string();
    Resource {
        control_path: format!("sim://{id}/control"),
        display_name: id.clone(),
        id,
        class,
        group: None,
    }
}

/// Link that comes up a fixed delay after the first query, or never.
#[derive(Debug)]
pub struct SimulatedLinkProbe {
    clock: Arc<dyn Clock>,
    delay: Option<Duration>,
    first_query: Mutex<HashMap<String, Instant>>,
    queries: AtomicU64,
}

impl SimulatedLinkProbe {
    /// `delay = None` keeps the link down forever.
    pub fn new(clock: Arc<dyn Clock>, delay: Option<Duration>) -> Self {
        Self {
            clock,
            delay,
            first_query: Mutex::new(HashMap::new()),
            queries: AtomicU64::new(0),
        }
    }

    /// Number of link queries so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Acquire)
    }
}

impl LinkProbe for SimulatedLinkProbe {
    fn link_up(&self, resource: &Resource) -> HotplugResult<bool> {
        self.queries.fetch_add(1, Ordering::AcqRel);
        let Some(delay) = self.delay else {
            return Ok(false);
        };
        let now = self.clock.now();
        let mut first = self.first_query.lock().unwrap_or_else(PoisonError::into_inner);
        let since = *first.entry(resource.id.clone()).or_insert(now);
        let up = now.duration_since(since) >= delay;
        if up {
            // Next cycle starts from a fresh link-down
            first.remove(&resource.id);
        }
        Ok(up)
    }
}

/// Reachability with a fixed answer and a call counter.
#[derive(Debug)]
pub struct SimulatedReachability {
    reachable: bool,
    calls: AtomicU64,
}

impl SimulatedReachability {
    /// Every probe answers `reachable`.
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of probes sent.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

impl ReachabilityProbe for SimulatedReachability {
    fn probe(
        &self,
        _resource: &Resource,
        _peer: IpAddr,
        _timeout: Duration,
    ) -> HotplugResult<bool> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        Ok(self.reachable)
    }
}

/// Fixed multipath topology with per-path states.
#[derive(Debug, Default)]
pub struct SimulatedPathProbe {
    paths: Mutex<BTreeMap<String, Vec<String>>>,
    states: Mutex<BTreeMap<String, PathState>>,
    enumerations: AtomicU64,
}

impl SimulatedPathProbe {
    /// Empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `paths` to `resource_id`, all initially active/ready.
    pub fn attach<S: AsRef<str>>(&self, resource_id: &str, paths: &[S]) {
        let names: Vec<String> = paths.iter().map(|p| p.as_ref().to_string()).collect();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for name in &names {
            states.insert(name.clone(), PathState::new("active", "ready"));
        }
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource_id.to_string(), names);
    }

    /// Override the state of one path.
    pub fn set_state(&self, path: &str, state: PathState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), state);
    }

    /// Number of times the path set was enumerated.
    pub fn enumerations(&self) -> u64 {
        self.enumerations.load(Ordering::Acquire)
    }
}

impl PathProbe for SimulatedPathProbe {
    fn paths(&self, resource: &Resource) -> HotplugResult<Vec<String>> {
        self.enumerations.fetch_add(1, Ordering::AcqRel);
        Ok(self
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource.id)
            .cloned()
            .unwrap_or_default())
    }

    fn path_state(&self, path: &str) -> HotplugResult<Option<PathState>> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned())
    }
}
