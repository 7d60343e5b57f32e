//! Provisioning modules
//!
//! A module reads one inventory block and builds a [`ModulePlan`]: the
//! ordered operations that bring a host to the state the block describes,
//! plus the handlers (daemon reloads, restarts, follow-up commands) that run
//! only when something changed.
//!
//! Building is pure. It sees the block, the host facts gathered up front and
//! the secret decryptor; it never talks to the host. A missing required key
//! is reported as [`ConfigError::Missing`] before any remote call is made.

pub mod amd_gpu;
pub mod disk_health;
pub mod disk_mounts;
pub mod k3s;
pub mod mergerfs;
pub mod nfs;
pub mod nvidia;
pub mod nvme_power;
pub mod raspberry;
pub mod snapraid;
pub mod sudoers;
pub mod telemetry;
pub mod voice_satellite;
pub mod wipe_disk;
pub mod zfs;

use anyhow::{Result, bail};
use declarative::{FileSpec, ModulePlan};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::host::HostFacts;
use crate::inventory::HostConfig;
use crate::secrets::SecretDecryptor;

/// Unit files live here
pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Problems with a module's inventory block
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{module}: required key '{key}' is missing")]
    Missing { module: String, key: String },

    #[error("{module}: invalid '{key}': {reason}")]
    Invalid {
        module: String,
        key: String,
        reason: String,
    },

    #[error("{module}: refused: {reason}")]
    Guard { module: String, reason: String },

    #[error("{module}: cannot decrypt secret: {reason}")]
    Secret { module: String, reason: String },
}

impl ConfigError {
    pub fn missing(module: &str, key: &str) -> Self {
        Self::Missing {
            module: module.to_string(),
            key: key.to_string(),
        }
    }

    pub fn invalid(module: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            module: module.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn guard(module: &str, reason: impl Into<String>) -> Self {
        Self::Guard {
            module: module.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for declarative::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { module, key } => Self::ConfigurationMissing { module, key },
            ConfigError::Invalid {
                module,
                key,
                reason,
            } => Self::InvalidConfiguration {
                module,
                reason: format!("{}: {}", key, reason),
            },
            ConfigError::Secret { module, reason } => Self::InvalidConfiguration {
                module,
                reason: format!("secret: {}", reason),
            },
            ConfigError::Guard { module, reason } => Self::ValidationGuard {
                operation: module,
                reason,
            },
        }
    }
}

/// Everything a module may look at while building
pub struct BuildContext<'a> {
    pub host: &'a HostConfig,
    pub facts: &'a HostFacts,
    pub secrets: &'a dyn SecretDecryptor,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        host: &'a HostConfig,
        facts: &'a HostFacts,
        secrets: &'a dyn SecretDecryptor,
    ) -> Self {
        Self {
            host,
            facts,
            secrets,
        }
    }

    /// Deserialize a required block
    pub fn block<T: DeserializeOwned>(&self, module: &str, path: &str) -> Result<T, ConfigError> {
        let value = self
            .host
            .block(path)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ConfigError::missing(module, path))?;
        serde_json::from_value(value.clone()).map_err(|e| parse_error(module, path, &e))
    }

    /// Deserialize an optional block, defaulting when absent
    pub fn block_or_default<T: DeserializeOwned + Default>(
        &self,
        module: &str,
        path: &str,
    ) -> Result<T, ConfigError> {
        match self.host.block(path) {
            None => Ok(T::default()),
            Some(v) if v.is_null() => Ok(T::default()),
            Some(_) => self.block(module, path),
        }
    }

    /// Home directory of the connecting user
    pub fn home(&self) -> &str {
        self.facts.home.trim_end_matches('/')
    }

    pub fn decrypt(&self, module: &str, token: &str) -> Result<String, ConfigError> {
        self.secrets
            .decrypt(token)
            .map_err(|e| ConfigError::Secret {
                module: module.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Turn a serde error into `Missing` when it names an absent field
fn parse_error(module: &str, path: &str, err: &serde_json::Error) -> ConfigError {
    let message = err.to_string();
    if let Some(rest) = message.strip_prefix("missing field `")
        && let Some((field, _)) = rest.split_once('`')
    {
        return ConfigError::missing(module, &format!("{}.{}", path, field));
    }
    ConfigError::invalid(module, path, message)
}

/// One provisioning unit
pub trait ProvisionModule: Send + Sync {
    /// Name used on the command line
    fn name(&self) -> &'static str;

    /// Inventory block the module reads (dotted path)
    fn block(&self) -> &'static str;

    /// One-line summary for `hostwright modules`
    fn description(&self) -> &'static str;

    /// Whether a full run should include this module for `host`
    fn applies(&self, host: &HostConfig) -> bool {
        host.has_block(self.block())
    }

    /// Included when no module is named explicitly
    fn run_by_default(&self) -> bool {
        true
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError>;
}

/// Every module, in the order a full run uses
pub fn all() -> Vec<Box<dyn ProvisionModule>> {
    vec![
        Box::new(sudoers::Sudoers),
        Box::new(raspberry::Raspberry),
        Box::new(nvme_power::NvmePower),
        Box::new(amd_gpu::AmdGpu),
        Box::new(nvidia::Nvidia),
        Box::new(disk_mounts::DiskMounts),
        Box::new(zfs::Zfs),
        Box::new(mergerfs::Mergerfs),
        Box::new(nfs::Nfs),
        Box::new(snapraid::Snapraid),
        Box::new(k3s::K3s),
        Box::new(telemetry::Telemetry),
        Box::new(disk_health::DiskHealth),
        Box::new(voice_satellite::VoiceSatellite),
        Box::new(wipe_disk::WipeDiskModule),
    ]
}

/// Modules named on the command line, in the canonical order
pub fn select(names: &[String]) -> Result<Vec<Box<dyn ProvisionModule>>> {
    let modules = all();
    for name in names {
        if !modules.iter().any(|m| m.name() == name) {
            let known: Vec<&str> = modules.iter().map(|m| m.name()).collect();
            bail!("Unknown module '{}' (known: {})", name, known.join(", "));
        }
    }
    Ok(modules
        .into_iter()
        .filter(|m| {
            if names.is_empty() {
                m.run_by_default()
            } else {
                names.iter().any(|n| n == m.name())
            }
        })
        .collect())
}

// ============================================================================
// Shared rendering helpers
// ============================================================================

/// Root-owned 0644 file under the systemd unit directory
pub fn unit_spec(unit: &str) -> FileSpec {
    FileSpec::root(format!("{}/{}", SYSTEMD_DIR, unit), "0644")
}

/// Command line split over continuation lines, as unit files usually show it
pub fn continued<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" \\\n    ")
}

/// One `ExecStart=` word; whitespace forces quoting and `%` is escaped
pub fn exec_word(word: &str) -> String {
    let word = word.replace('%', "%%");
    if word.contains(char::is_whitespace) {
        format!("\"{}\"", word.replace('"', "\\\""))
    } else {
        word
    }
}

/// A systemd unit with the common `[Unit]`/`[Service]`/`[Install]` layout
#[derive(Debug, Clone, Default)]
pub struct UnitFile {
    pub description: String,
    pub after: Vec<String>,
    pub wants: Vec<String>,
    pub requires: Vec<String>,
    pub service: Vec<(String, String)>,
    pub wanted_by: String,
}

impl UnitFile {
    pub fn service(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            wanted_by: "multi-user.target".to_string(),
            ..Self::default()
        }
    }

    pub fn after(mut self, unit: &str) -> Self {
        self.after.push(unit.to_string());
        self
    }

    pub fn wants(mut self, unit: &str) -> Self {
        self.wants.push(unit.to_string());
        self
    }

    pub fn requires(mut self, unit: &str) -> Self {
        self.requires.push(unit.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.service.push((key.to_string(), value.into()));
        self
    }

    /// Drop the `[Install]` section (units started by a timer)
    pub fn without_install(mut self) -> Self {
        self.wanted_by.clear();
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("[Unit]\nDescription={}\n", self.description);
        for (key, units) in [
            ("Wants", &self.wants),
            ("After", &self.after),
            ("Requires", &self.requires),
        ] {
            if !units.is_empty() {
                out.push_str(&format!("{}={}\n", key, units.join(" ")));
            }
        }
        out.push_str("\n[Service]\n");
        for (key, value) in &self.service {
            out.push_str(&format!("{}={}\n", key, value));
        }
        if !self.wanted_by.is_empty() {
            out.push_str(&format!("\n[Install]\nWantedBy={}\n", self.wanted_by));
        }
        out
    }
}

// ============================================================================
// Test helpers
// ============================================================================

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::inventory::Inventory;
    use crate::secrets::{CommandDecryptor, SecretDecryptor, SecretError};
    use declarative::testing::FakeHost;
    use declarative::{ExecuteOptions, ModuleReport, NoProgress, execute_plan};

    /// Decryptor that reverses tokens, enough to prove decryption ran
    pub struct Reverse;

    impl SecretDecryptor for Reverse {
        fn decrypt(&self, token: &str) -> Result<String, SecretError> {
            Ok(token.chars().rev().collect())
        }
    }

    pub fn facts() -> HostFacts {
        HostFacts {
            hostname: "apollo".into(),
            home: "/home/admin".into(),
            arch: "x86_64".into(),
        }
    }

    /// Host config from a JSON object of blocks
    pub fn host(blocks: serde_json::Value) -> HostConfig {
        let inventory = Inventory::from_json(
            &serde_json::json!({ "hosts": { "apollo.example.net": blocks } }).to_string(),
        )
        .unwrap();
        inventory.host("apollo.example.net").unwrap()
    }

    pub fn build(
        module: &dyn ProvisionModule,
        blocks: serde_json::Value,
    ) -> Result<ModulePlan, ConfigError> {
        let host = host(blocks);
        let facts = facts();
        module.build(&BuildContext::new(&host, &facts, &Reverse))
    }

    pub fn build_plain(
        module: &dyn ProvisionModule,
        blocks: serde_json::Value,
    ) -> Result<ModulePlan, ConfigError> {
        let host = host(blocks);
        let facts = facts();
        let secrets = CommandDecryptor::new(None, "HOST_SECRETS_PASSWORD", None);
        module.build(&BuildContext::new(&host, &facts, &secrets))
    }

    pub fn run(plan: &ModulePlan, host: &FakeHost) -> ModuleReport {
        execute_plan(plan, host, &ExecuteOptions::default(), &mut NoProgress)
    }

    /// Number of operations that changed something
    pub fn changes(report: &ModuleReport) -> usize {
        report.summary().changed
    }

    /// Run twice and check the second run is a no-op
    pub fn assert_idempotent(plan: &ModulePlan, host: &FakeHost) {
        let first = run(plan, host);
        assert!(first.is_success(), "first run failed: {:?}", first.error);
        assert!(first.changed());

        let calls = host.calls().len();
        let second = run(plan, host);
        assert!(second.is_success(), "second run failed: {:?}", second.error);
        assert_eq!(changes(&second), 0, "second run changed: {:?}", second.steps);
        assert!(second.handlers.is_empty());
        assert_eq!(host.calls().len(), calls, "second run touched the host");
    }

    pub fn ids(plan: &ModulePlan) -> Vec<String> {
        plan.operations.iter().map(|op| op.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[allow(dead_code)]
        token: String,
    }

    #[test]
    fn test_missing_block_and_field() {
        let host = host(json!({"k3s_cluster": {"name": "x"}}));
        let facts = facts();
        let ctx = BuildContext::new(&host, &facts, &Reverse);

        assert_eq!(
            ctx.block::<Sample>("k3s", "zfs_config").unwrap_err(),
            ConfigError::missing("k3s", "zfs_config")
        );
        assert_eq!(
            ctx.block::<Sample>("k3s", "k3s_cluster").unwrap_err(),
            ConfigError::missing("k3s", "k3s_cluster.token")
        );
    }

    #[test]
    fn test_invalid_type() {
        let host = host(json!({"k3s_cluster": {"token": 5}}));
        let facts = facts();
        let ctx = BuildContext::new(&host, &facts, &Reverse);
        assert!(matches!(
            ctx.block::<Sample>("k3s", "k3s_cluster").unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_error_mapping() {
        let err: declarative::Error = ConfigError::missing("zfs", "zfs_config.pools").into();
        assert_eq!(err.category(), "configuration");

        let err: declarative::Error = ConfigError::guard("wipe-disk", "protected").into();
        assert_eq!(err.category(), "guard");
    }

    #[test]
    fn test_select_order_and_defaults() {
        let names: Vec<&str> = select(&[]).unwrap().iter().map(|m| m.name()).collect();
        assert!(!names.contains(&"wipe-disk"));
        assert_eq!(names.first(), Some(&"sudoers"));

        let picked = select(&["telemetry".into(), "k3s".into()]).unwrap();
        let picked: Vec<&str> = picked.iter().map(|m| m.name()).collect();
        assert_eq!(picked, vec!["k3s", "telemetry"]);

        assert!(select(&["wipe-disk".into()]).is_ok());
        assert!(select(&["nope".into()]).is_err());
    }

    #[test]
    fn test_module_names_are_unique() {
        let modules = all();
        let mut names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 15);
    }

    #[test]
    fn test_unit_file_render() {
        let unit = UnitFile::service("Alloy")
            .wants("network-online.target")
            .after("network-online.target")
            .set("ExecStart", "/usr/bin/alloy run")
            .set("Restart", "always")
            .render();
        assert_eq!(
            unit,
            "[Unit]\nDescription=Alloy\nWants=network-online.target\nAfter=network-online.target\n\n\
             [Service]\nExecStart=/usr/bin/alloy run\nRestart=always\n\n\
             [Install]\nWantedBy=multi-user.target\n"
        );
    }

    #[test]
    fn test_exec_words() {
        assert_eq!(exec_word("--uri"), "--uri");
        assert_eq!(exec_word("50%"), "50%%");
        assert_eq!(exec_word("my satellite"), "\"my satellite\"");
        assert_eq!(
            continued(&["/usr/bin/run", "--a", "--b"]),
            "/usr/bin/run \\\n    --a \\\n    --b"
        );
    }
}
