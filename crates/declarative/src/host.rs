//! Host executor - the mutating side of a managed host

use crate::error::ExecError;
use crate::facts::FactProbe;
use crate::types::CommandOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A shell command to run on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Script passed to `sh -c`
    pub script: String,
    /// Run with elevated privileges
    pub sudo: bool,
    /// Extra environment for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the command after this long
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// A command run as root
    pub fn root(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            sudo: true,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// A command run as the connecting user
    pub fn user(script: impl Into<String>) -> Self {
        Self {
            sudo: false,
            ..Self::root(script)
        }
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set a timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where and how a file or directory should exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Write with elevated privileges
    pub sudo: bool,
}

impl FileSpec {
    /// A root-owned path
    pub fn root(path: impl Into<String>, mode: &str) -> Self {
        Self {
            path: path.into(),
            mode: Some(mode.to_string()),
            owner: Some("root".to_string()),
            group: Some("root".to_string()),
            sudo: true,
        }
    }

    /// A path with no ownership or mode requirements
    pub fn plain(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: None,
            owner: None,
            group: None,
            sudo: true,
        }
    }

    /// A path owned by the connecting user
    pub fn user(path: impl Into<String>, mode: &str) -> Self {
        Self {
            path: path.into(),
            mode: Some(mode.to_string()),
            owner: None,
            group: None,
            sudo: false,
        }
    }

    /// Set owner and group
    pub fn owned_by(mut self, owner: &str, group: &str) -> Self {
        self.owner = Some(owner.to_string());
        self.group = Some(group.to_string());
        self
    }
}

/// Desired enablement/activity of a systemd unit. `None` leaves it as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub enabled: Option<bool>,
    pub running: Option<bool>,
}

/// Mutating capability of a managed host
///
/// Every method is a blocking round-trip. Side effects are not reversible by
/// the executor; operations that rewrite existing files call
/// [`HostExecutor::backup_file`] first.
pub trait HostExecutor: Send + Sync {
    /// Write `content` to `spec.path`, then apply mode and ownership
    fn write_file(&self, spec: &FileSpec, content: &[u8]) -> Result<(), ExecError>;

    /// Copy `path` to `path.bak`
    fn backup_file(&self, path: &str) -> Result<(), ExecError>;

    /// Create a directory (and parents), then apply mode and ownership
    fn create_directory(&self, spec: &FileSpec) -> Result<(), ExecError>;

    /// Install system packages, optionally refreshing the index first
    fn install_packages(&self, packages: &[String], update: bool) -> Result<(), ExecError>;

    /// Converge enablement/activity of a unit
    fn set_service(&self, unit: &str, target: ServiceTarget) -> Result<(), ExecError>;

    /// Restart a unit
    fn restart_service(&self, unit: &str) -> Result<(), ExecError>;

    /// `systemctl daemon-reload`
    fn daemon_reload(&self) -> Result<(), ExecError>;

    /// Set a kernel parameter, optionally persisting it
    fn set_sysctl(&self, key: &str, value: &str, persist: bool) -> Result<(), ExecError>;

    /// Load a kernel module
    fn load_kernel_module(&self, name: &str) -> Result<(), ExecError>;

    /// Mount the fstab entry for `target`
    fn mount(&self, target: &str) -> Result<(), ExecError>;

    /// Run a command; a non-zero exit is an error
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// A managed host: read facts and apply changes
pub trait Host: FactProbe + HostExecutor {
    /// Name used in logs and reports
    fn name(&self) -> &str;
}
