//! Configuration structures for a hot-plug run.
//!
//! Supports TOML deserialization. Every timeout is a humantime string
//! (`"10s"`, `"2m"`). The per-class defaults reflect values tuned on real
//! adapters; treat them as starting points, not constants.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    /// Remove/add cycles per resource.
    pub iterations: u32,

    /// Resource descriptors (`0001:00:00.0`, `cpu3`, `core:1`).
    pub resources: Vec<String>,

    /// Order in which resources are exercised.
    pub ordering: OrderingConfig,

    /// Presence timeouts shared by every class.
    pub timeouts: TimeoutConfig,

    /// Per-class recovery configuration.
    pub recovery: RecoveryConfig,

    /// Run-wide execution policy.
    pub run: RunConfig,

    /// Location of the kernel pseudo-filesystems.
    pub sysfs: SysfsConfig,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            resources: Vec::new(),
            ordering: OrderingConfig::default(),
            timeouts: TimeoutConfig::default(),
            recovery: RecoveryConfig::default(),
            run: RunConfig::default(),
            sysfs: SysfsConfig::default(),
        }
    }
}

/// Ordering strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingKind {
    /// Exercise resources in the order given.
    #[default]
    Identity,
    /// Shuffle groups and their members every iteration.
    SeededRandom,
}

/// Ordering configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrderingConfig {
    /// Strategy to use.
    pub strategy: OrderingKind,
    /// Seed for `seeded_random`; drawn at startup when absent.
    pub seed: Option<u64>,
}

/// Presence polling timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a removed resource may take to disappear.
    #[serde(with = "humantime_serde")]
    pub remove: Duration,

    /// How long an added resource may take to reappear.
    #[serde(with = "humantime_serde")]
    pub add: Duration,

    /// Sleep between predicate evaluations.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            remove: Duration::from_secs(10),
            add: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Per-class recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Network adapters.
    pub network: NetworkRecoveryConfig,
    /// Multipath storage adapters.
    pub multipath: MultipathRecoveryConfig,
    /// Everything else.
    pub generic: GenericRecoveryConfig,
}

/// Network recovery: link up, then peer reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRecoveryConfig {
    /// Peer address probed once the link is up.
    pub peer: Option<IpAddr>,

    /// Minimum delay after re-add before the first link check.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,

    /// How long the link may take to come up.
    #[serde(with = "humantime_serde")]
    pub link_timeout: Duration,

    /// How long the peer may take to answer.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for NetworkRecoveryConfig {
    fn default() -> Self {
        Self {
            peer: None,
            settle: Duration::from_secs(45),
            link_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Multipath recovery: every path back to active/ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipathRecoveryConfig {
    /// Minimum delay after re-add before the first path check.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,

    /// Per-path convergence timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MultipathRecoveryConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(45),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Generic recovery: presence only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericRecoveryConfig {
    /// Minimum delay after re-add before confirming presence.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,

    /// Presence confirmation timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GenericRecoveryConfig {
    fn default() -> Self {
        Self {
            settle: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Run-wide execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock budget for the whole run; no new cycles start once spent.
    #[serde(with = "humantime_serde::option")]
    pub budget: Option<Duration>,

    /// Run one worker thread per resource.
    pub parallel: bool,

    /// Re-enable a resource left removed by a failed cycle.
    pub restore_on_failure: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget: None,
            parallel: false,
            restore_on_failure: true,
        }
    }
}

/// Kernel pseudo-filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SysfsConfig {
    /// Root under which `sys/` and `proc/` are found.
    pub root: PathBuf,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl HotplugConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
