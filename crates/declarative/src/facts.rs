//! Fact probing - read-only queries against a managed host
//!
//! Operations never look at the host directly. They ask a [`FactProbe`],
//! which a real transport implements by running commands and a test
//! implements from memory.

use crate::error::ProbeError;
use crate::host::CommandSpec;
use crate::types::CommandOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A regular file on the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileFact {
    pub content: Vec<u8>,
    /// Octal permission bits without leading zeros (e.g. "644")
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl FileFact {
    /// File content as text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).to_string()
    }
}

/// A directory on the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryFact {
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// State of a systemd unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceFact {
    /// Unit file is known to systemd
    pub loaded: bool,
    pub enabled: bool,
    pub active: bool,
}

/// A mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFact {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

/// Read-only capability answering "does the host already look like this?"
///
/// Implementations must never mutate the host. A query that cannot run
/// (connection lost, permission denied) returns [`ProbeError`]; a target that
/// simply does not exist returns `None`/`false`.
pub trait FactProbe: Send + Sync {
    /// Regular file at `path`
    fn file(&self, path: &str) -> Result<Option<FileFact>, ProbeError>;

    /// Directory at `path`
    fn directory(&self, path: &str) -> Result<Option<DirectoryFact>, ProbeError>;

    /// Installed version of a system package
    fn package(&self, name: &str) -> Result<Option<String>, ProbeError>;

    /// Enablement and activity of a systemd unit
    fn service(&self, unit: &str) -> Result<ServiceFact, ProbeError>;

    /// Live value of a kernel parameter
    fn sysctl(&self, key: &str) -> Result<Option<String>, ProbeError>;

    /// Whether a kernel module is loaded
    fn kernel_module(&self, name: &str) -> Result<bool, ProbeError>;

    /// Names of imported ZFS pools
    fn zfs_pools(&self) -> Result<Vec<String>, ProbeError>;

    /// Properties of a ZFS dataset, if it exists
    fn zfs_dataset(&self, name: &str) -> Result<Option<BTreeMap<String, String>>, ProbeError>;

    /// Currently mounted filesystems
    fn mounts(&self) -> Result<Vec<MountFact>, ProbeError>;

    /// Whether `path` is a block device
    fn block_device(&self, path: &str) -> Result<bool, ProbeError>;

    /// Run a read-only check and report whether it exited 0
    fn check(&self, command: &CommandSpec) -> Result<bool, ProbeError>;

    /// Run a read-only command and capture its output
    fn output(&self, command: &CommandSpec) -> Result<CommandOutput, ProbeError>;
}

/// Normalize an octal mode string: "0644" and "644" compare equal
pub fn normalize_mode(mode: &str) -> String {
    let trimmed = mode.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
