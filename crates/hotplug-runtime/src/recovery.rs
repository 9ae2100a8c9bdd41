//! Class-specific recovery verification.
//!
//! After a resource reappears, its verifier decides whether it is functionally
//! restored. There is one verifier per [`DeviceClass`]; [`RecoverySuite`]
//! picks it with a plain match on the class recorded at resolution time.

use hotplug_common::{
    DeviceClass, HotplugConfig, HotplugResult, PollError, PollWaiter, Resource,
};
use hotplug_sysfs::{LinkProbe, PathProbe, ReachabilityProbe, ResourceControl};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failing detail recorded when the link never came up.
pub const LINK_DOWN: &str = "link-down";

/// Verdict of a recovery check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Whether the resource is functionally restored.
    pub verified: bool,
    /// What did not recover.
    pub failing_detail: Option<String>,
}

impl Verification {
    /// A passing verdict.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            verified: true,
            failing_detail: None,
        }
    }

    /// A failing verdict with `detail`.
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            verified: false,
            failing_detail: Some(detail.into()),
        }
    }
}

/// Confirms a re-added resource is functionally restored.
pub trait RecoveryVerifier: Send + Sync {
    /// Class this verifier handles.
    fn class(&self) -> DeviceClass;

    /// Minimum delay between re-add and the first check.
    fn settle_time(&self) -> Duration;

    /// Run the check, polling through `waiter`.
    ///
    /// Non-convergence is a failing [`Verification`], not an error. An `Err`
    /// means the check itself could not run to completion.
    fn verify(&self, resource: &Resource, waiter: &PollWaiter) -> HotplugResult<Verification>;
}

/// Network adapters: link up, then the peer answers.
pub struct NetworkRecovery {
    link: Arc<dyn LinkProbe>,
    reach: Arc<dyn ReachabilityProbe>,
    peer: Option<IpAddr>,
    settle: Duration,
    link_timeout: Duration,
    probe_timeout: Duration,
    interval: Duration,
}

impl NetworkRecovery {
    /// Create a network verifier.
    pub fn new(
        link: Arc<dyn LinkProbe>,
        reach: Arc<dyn ReachabilityProbe>,
        peer: Option<IpAddr>,
    ) -> Self {
        let defaults = hotplug_common::NetworkRecoveryConfig::default();
        Self {
            link,
            reach,
            peer,
            settle: defaults.settle,
            link_timeout: defaults.link_timeout,
            probe_timeout: defaults.probe_timeout,
            interval: Duration::from_secs(1),
        }
    }

    /// Override timing.
    #[must_use]
    pub fn with_timing(
        mut self,
        settle: Duration,
        link_timeout: Duration,
        probe_timeout: Duration,
        interval: Duration,
    ) -> Self {
        self.settle = settle;
        self.link_timeout = link_timeout;
        self.probe_timeout = probe_timeout;
        self.interval = interval;
        self
    }
}

impl RecoveryVerifier for NetworkRecovery {
    fn class(&self) -> DeviceClass {
        DeviceClass::Network
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }

    fn verify(&self, resource: &Resource, waiter: &PollWaiter) -> HotplugResult<Verification> {
        let link_up = waiter.wait_for(
            || self.link.link_up(resource).map_err(PollError::from),
            self.link_timeout,
            self.interval,
        )?;
        if !link_up {
            warn!(
                resource = %resource.id,
                timeout_ms = self.link_timeout.as_millis(),
                "Link did not come up"
            );
            return Ok(Verification::failed(LINK_DOWN));
        }
        debug!(resource = %resource.id, "Link up");

        let Some(peer) = self.peer else {
            warn!(resource = %resource.id, "No peer configured, accepting link state alone");
            return Ok(Verification::passed());
        };

        let attempt_timeout = self.interval.max(Duration::from_secs(1)).min(self.probe_timeout);
        let reachable = waiter.wait_for(
            || self.reach.probe(resource, peer, attempt_timeout).map_err(PollError::from),
            self.probe_timeout,
            self.interval,
        )?;

        if reachable {
            info!(resource = %resource.id, %peer, "Peer reachable");
            Ok(Verification::passed())
        } else {
            warn!(resource = %resource.id, %peer, "Peer unreachable");
            Ok(Verification::failed(format!("peer {peer} unreachable")))
        }
    }
}

/// Multipath storage adapters: every disk path back to active/ready.
pub struct StorageMultipathRecovery {
    probe: Arc<dyn PathProbe>,
    settle: Duration,
    timeout: Duration,
    interval: Duration,
}

impl StorageMultipathRecovery {
    /// Create a multipath verifier.
    pub fn new(probe: Arc<dyn PathProbe>) -> Self {
        let defaults = hotplug_common::MultipathRecoveryConfig::default();
        Self {
            probe,
            settle: defaults.settle,
            timeout: defaults.timeout,
            interval: Duration::from_secs(1),
        }
    }

    /// Override timing.
    #[must_use]
    pub fn with_timing(mut self, settle: Duration, timeout: Duration, interval: Duration) -> Self {
        self.settle = settle;
        self.timeout = timeout;
        self.interval = interval;
        self
    }
}

impl RecoveryVerifier for StorageMultipathRecovery {
    fn class(&self) -> DeviceClass {
        DeviceClass::StorageMultipath
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }

    fn verify(&self, resource: &Resource, waiter: &PollWaiter) -> HotplugResult<Verification> {
        // Path membership belongs to the adapter; enumerate once.
        let paths = self.probe.paths(resource)?;
        if paths.is_empty() {
            warn!(resource = %resource.id, "No multipath paths found");
            return Ok(Verification::failed("no multipath paths found"));
        }

        let mut failing = Vec::new();
        for path in &paths {
            let ready = waiter.wait_for(
                || {
                    let state = self.probe.path_state(path)?;
                    Ok(state.is_some_and(|s| s.is_active_ready()))
                },
                self.timeout,
                self.interval,
            )?;
            if ready {
                debug!(resource = %resource.id, %path, "Path active/ready");
            } else {
                warn!(resource = %resource.id, %path, "Path did not reach active/ready");
                failing.push(path.clone());
            }
        }

        if failing.is_empty() {
            info!(resource = %resource.id, paths = paths.len(), "All paths recovered");
            Ok(Verification::passed())
        } else {
            Ok(Verification::failed(failing.join(",")))
        }
    }
}

/// Any other class: present again is recovered.
pub struct GenericRecovery {
    control: Arc<dyn ResourceControl>,
    settle: Duration,
    timeout: Duration,
    interval: Duration,
}

impl GenericRecovery {
    /// Create a presence-only verifier.
    pub fn new(control: Arc<dyn ResourceControl>) -> Self {
        let defaults = hotplug_common::GenericRecoveryConfig::default();
        Self {
            control,
            settle: defaults.settle,
            timeout: defaults.timeout,
            interval: Duration::from_secs(1),
        }
    }

    /// Override timing.
    #[must_use]
    pub fn with_timing(mut self, settle: Duration, timeout: Duration, interval: Duration) -> Self {
        self.settle = settle;
        self.timeout = timeout;
        self.interval = interval;
        self
    }
}

impl RecoveryVerifier for GenericRecovery {
    fn class(&self) -> DeviceClass {
        DeviceClass::Generic
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }

    fn verify(&self, resource: &Resource, waiter: &PollWaiter) -> HotplugResult<Verification> {
        let present = waiter.wait_for(
            || Ok(self.control.is_present(resource)?),
            self.timeout,
            self.interval,
        )?;
        Ok(if present {
            Verification::passed()
        } else {
            Verification::failed("not present")
        })
    }
}

/// One verifier per device class.
pub struct RecoverySuite {
    network: Box<dyn RecoveryVerifier>,
    multipath: Box<dyn RecoveryVerifier>,
    generic: Box<dyn RecoveryVerifier>,
}

impl RecoverySuite {
    /// Assemble a suite from explicit verifiers.
    pub fn new(
        network: Box<dyn RecoveryVerifier>,
        multipath: Box<dyn RecoveryVerifier>,
        generic: Box<dyn RecoveryVerifier>,
    ) -> Self {
        Self {
            network,
            multipath,
            generic,
        }
    }

    /// Build the standard suite from configuration and probes.
    pub fn from_config(
        config: &HotplugConfig,
        control: Arc<dyn ResourceControl>,
        link: Arc<dyn LinkProbe>,
        reach: Arc<dyn ReachabilityProbe>,
        paths: Arc<dyn PathProbe>,
    ) -> Self {
        let interval = config.timeouts.poll_interval;
        let net = &config.recovery.network;
        let mp = &config.recovery.multipath;
        let generic = &config.recovery.generic;

        Self::new(
            Box::new(
                NetworkRecovery::new(link, reach, net.peer)
                    .with_timing(net.settle, net.link_timeout, net.probe_timeout, interval),
            ),
            Box::new(
                StorageMultipathRecovery::new(paths).with_timing(mp.settle, mp.timeout, interval),
            ),
            Box::new(GenericRecovery::new(control).with_timing(
                generic.settle,
                generic.timeout,
                interval,
            )),
        )
    }

    /// Verifier for `class`.
    pub fn for_class(&self, class: DeviceClass) -> &dyn RecoveryVerifier {
        match class {
            DeviceClass::Network => self.network.as_ref(),
            DeviceClass::StorageMultipath => self.multipath.as_ref(),
            DeviceClass::Generic => self.generic.as_ref(),
        }
    }
}
