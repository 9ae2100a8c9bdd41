//! Kernel boundary for hot-plug cycles.
//!
//! This crate provides:
//! - [`ResourceControl`] trait for requesting removal/addition and enumerating
//!   present resources
//! - [`control`] module with the sysfs implementation
//! - [`registry`] module resolving descriptors into [`Resource`] records
//! - [`ordering`] module with identity and seeded-random iteration orders
//! - [`probe`] module with link, reachability and multipath path probes
//! - [`simulated`] module with in-memory stand-ins for all of the above

pub mod control;
pub mod ordering;
pub mod probe;
pub mod registry;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use control::*;
pub use ordering::*;
pub use probe::*;
pub use registry::*;
#[cfg(feature = "simulated")]
pub use simulated::*;

use hotplug_common::{HotplugResult, Resource};
use std::collections::BTreeSet;

/// Value written to a control attribute to request removal.
pub const DISABLE_VALUE: &str = "0\n";

/// Value written to a control attribute to request addition.
pub const ENABLE_VALUE: &str = "1\n";

/// Resource control abstraction.
///
/// Both write operations are asynchronous: a successful return only means the
/// kernel accepted the request. Completion has to be observed through
/// [`list_present`](ResourceControl::list_present).
pub trait ResourceControl: Send + Sync {
    /// Request removal of `resource`.
    ///
    /// Failure to write the control attribute is reported as
    /// [`HotplugError::FatalIo`](hotplug_common::HotplugError::FatalIo).
    fn request_remove(&self, resource: &Resource) -> HotplugResult<()>;

    /// Request (re-)addition of `resource`.
    fn request_add(&self, resource: &Resource) -> HotplugResult<()>;

    /// Identifiers of all currently visible resources.
    fn list_present(&self) -> HotplugResult<BTreeSet<String>>;

    /// Whether `resource` is currently visible.
    fn is_present(&self, resource: &Resource) -> HotplugResult<bool> {
        Ok(self.list_present()?.contains(&resource.id))
    }
}
