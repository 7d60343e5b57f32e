//! Inventory - the static per-host data every module reads
//!
//! Loaded once at startup and never mutated. Each host carries connection
//! settings plus named blocks (`k3s_cluster`, `zfs_config`, ...). Blocks under
//! `[defaults]` are deep-merged into every host, host values winning.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// How hostwright reaches a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    #[default]
    Ssh,
    Local,
}

/// A host as written in the inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    /// Address to connect to; defaults to the host name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub connection: Connection,
    /// Prefix privileged commands with `sudo -n`
    #[serde(default = "default_true")]
    pub sudo: bool,
    /// Configuration blocks keyed by name
    #[serde(flatten)]
    pub blocks: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// The whole inventory file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,
}

/// A host with defaults merged in; what modules see
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub connection: Connection,
    pub sudo: bool,
    pub blocks: Map<String, Value>,
}

impl HostConfig {
    /// Look up a block by dotted path (`alloy.smartctl`)
    pub fn block(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.blocks.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Whether a block exists and is not null
    pub fn has_block(&self, path: &str) -> bool {
        self.block(path).is_some_and(|v| !v.is_null())
    }

    /// `enabled = true` inside a block
    pub fn block_enabled(&self, path: &str) -> bool {
        self.block(path)
            .and_then(|v| v.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

impl Inventory {
    /// Load an inventory file, TOML or JSON by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read inventory {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let inventory = match ext.as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|toml_err| {
                Self::from_json(&content).map_err(|_| toml_err)
            }),
        }
        .with_context(|| format!("Invalid inventory {}", path.display()))?;

        log::debug!(
            "Loaded {} hosts and {} groups from {}",
            inventory.hosts.len(),
            inventory.groups.len(),
            path.display()
        );
        Ok(inventory)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON")
    }

    /// Resolve one host with defaults merged in
    pub fn host(&self, name: &str) -> Result<HostConfig> {
        let Some(entry) = self.hosts.get(name) else {
            bail!("Unknown host '{}'", name);
        };

        let mut blocks = Value::Object(self.defaults.clone());
        deep_merge(&mut blocks, &Value::Object(entry.blocks.clone()));
        let blocks = match blocks {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(HostConfig {
            name: name.to_string(),
            address: entry.address.clone().unwrap_or_else(|| name.to_string()),
            ssh_user: entry.ssh_user.clone(),
            ssh_port: entry.ssh_port,
            connection: entry.connection,
            sudo: entry.sudo,
            blocks,
        })
    }

    /// Hosts matching `limit` (host or group names); everything when empty
    pub fn select(&self, limit: &[String]) -> Result<Vec<HostConfig>> {
        if limit.is_empty() {
            return self.hosts.keys().map(|name| self.host(name)).collect();
        }

        let mut wanted = BTreeSet::new();
        for item in limit {
            if self.hosts.contains_key(item) {
                wanted.insert(item.as_str());
            } else if let Some(members) = self.groups.get(item) {
                wanted.extend(members.iter().map(String::as_str));
            } else {
                bail!("'{}' is neither a host nor a group in the inventory", item);
            }
        }

        wanted.into_iter().map(|name| self.host(name)).collect()
    }

    /// Groups a host belongs to
    pub fn groups_of(&self, host: &str) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == host))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Structural problems that would make runs fail
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (group, members) in &self.groups {
            if self.hosts.contains_key(group) {
                problems.push(format!("group '{}' shadows a host of the same name", group));
            }
            for member in members {
                if !self.hosts.contains_key(member) {
                    problems.push(format!("group '{}' lists unknown host '{}'", group, member));
                }
            }
        }
        for (name, entry) in &self.hosts {
            if entry.connection == Connection::Local && entry.address.is_some() {
                problems.push(format!("host '{}' is local but sets an address", name));
            }
            for (block, value) in &entry.blocks {
                if !(value.is_object() || value.is_array()) {
                    problems.push(format!(
                        "host '{}': block '{}' must be a table or a list",
                        name, block
                    ));
                }
            }
        }
        problems
    }
}

// ============================================================================
// Tests
// ============================================================================
