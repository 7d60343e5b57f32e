//! zfs - pools, datasets and their mountpoints

use declarative::{FileSpec, ModulePlan};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::{AptPackages, Directory, ZfsDataset, ZfsPool};

const NAME: &str = "zfs";

/// Dataset keys that describe the mountpoint directory, not ZFS properties
const DIRECTORY_KEYS: &[&str] = &["user", "group", "mode"];

#[derive(Debug, Default, Deserialize)]
struct ZfsConfig {
    #[serde(default)]
    pools: BTreeMap<String, PoolConfig>,
    #[serde(default)]
    datasets: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolConfig {
    devices: Vec<String>,
    #[serde(default, rename = "type")]
    vdev_type: Option<String>,
    #[serde(default)]
    ashift: Option<u32>,
}

/// Inventory values may be strings, numbers or booleans
fn property_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        other => other.to_string(),
    }
}

pub struct Zfs;

impl ProvisionModule for Zfs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "zfs_config"
    }

    fn description(&self) -> &'static str {
        "ZFS pools and datasets"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: ZfsConfig = ctx.block(NAME, self.block())?;

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["zfsutils-linux", "nfs-kernel-server"]).with_update());

        for (name, pool) in &config.pools {
            if pool.devices.is_empty() {
                return Err(ConfigError::missing(
                    NAME,
                    &format!("zfs_config.pools.{}.devices", name),
                ));
            }
            plan.add(ZfsPool {
                name: name.clone(),
                vdev_type: pool.vdev_type.clone().filter(|t| !t.is_empty()),
                devices: pool.devices.clone(),
                ashift: pool.ashift,
            });
        }

        for (name, settings) in &config.datasets {
            let properties: BTreeMap<String, String> = settings
                .iter()
                .filter(|(k, _)| !DIRECTORY_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), property_value(v)))
                .collect();
            plan.add(ZfsDataset {
                name: name.clone(),
                properties,
            });

            if let Some(mountpoint) = settings.get("mountpoint").and_then(Value::as_str) {
                let text = |key: &str, default: &str| {
                    settings
                        .get(key)
                        .map(property_value)
                        .unwrap_or_else(|| default.to_string())
                };
                plan.add(Directory::new(
                    FileSpec::root(mountpoint, &text("mode", "777"))
                        .owned_by(&text("user", "nobody"), &text("group", "nogroup")),
                ));
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::testing::FakeHost;
    use serde_json::json;

    fn blocks() -> serde_json::Value {
        json!({"zfs_config": {
            "pools": {
                "tank": {"devices": ["mirror", "/dev/sdb", "/dev/sdc"], "ashift": 12}
            },
            "datasets": {
                "tank/media": {
                    "mountpoint": "/mnt/media",
                    "compression": "lz4",
                    "atime": false,
                    "user": "media"
                }
            }
        }})
    }

    fn zfs_host() -> FakeHost {
        let host = FakeHost::new("h");
        host.on_run("zpool create", |s| s.zfs_pools.push("tank".into()));
        host.on_run("zfs create -p", |s| {
            let props = [
                ("atime", "off"),
                ("compression", "lz4"),
                ("mountpoint", "/mnt/media"),
            ];
            s.zfs_datasets.insert(
                "tank/media".into(),
                props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            );
        });
        host
    }

    #[test]
    fn test_pool_dataset_and_mountpoint() {
        let host = zfs_host();
        let plan = build(&Zfs, blocks()).unwrap();
        assert!(plan.has_destructive());
        assert_idempotent(&plan, &host);

        assert_eq!(host.run_count("zpool create -o ashift=12 tank mirror /dev/sdb /dev/sdc"), 1);
        let create = host
            .scripts()
            .into_iter()
            .find(|s| s.starts_with("zfs create"))
            .unwrap();
        assert!(create.contains("-o atime=off"));
        assert!(!create.contains("user="));

        host.with_state(|s| {
            let dir = &s.directories["/mnt/media"];
            assert_eq!(dir.owner.as_deref(), Some("media"));
            assert_eq!(dir.group.as_deref(), Some("nogroup"));
        });
    }

    #[test]
    fn test_existing_pool_is_left_alone() {
        let host = zfs_host();
        host.with_state(|s| s.zfs_pools.push("tank".into()));
        run(&build(&Zfs, blocks()).unwrap(), &host);
        assert_eq!(host.run_count("zpool create"), 0);
    }

    #[test]
    fn test_pool_devices_required() {
        let err = build(&Zfs, json!({"zfs_config": {"pools": {"tank": {"type": "raidz"}}}}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }
}
