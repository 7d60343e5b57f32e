//! mergerfs - pooled filesystems over several data disks

use declarative::ModulePlan;
use serde::Deserialize;

use super::disk_mounts::{add_mount, default_options};
use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::AptPackages;

const NAME: &str = "mergerfs";

#[derive(Debug, Deserialize)]
struct MergerfsConfig {
    #[serde(default)]
    pools: Vec<Pool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Pool {
    name: String,
    sources: Vec<String>,
    mount_point: String,
    #[serde(default = "default_options")]
    options: String,
}

impl Pool {
    fn fstab_line(&self) -> String {
        format!(
            "{} {} mergerfs {} 0 0",
            self.sources.join(":"),
            self.mount_point,
            self.options
        )
    }
}

pub struct Mergerfs;

impl ProvisionModule for Mergerfs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "mergerfs_config"
    }

    fn description(&self) -> &'static str {
        "mergerfs pools in /etc/fstab"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: MergerfsConfig = ctx.block(NAME, self.block())?;
        if config.pools.is_empty() {
            return Err(ConfigError::missing(NAME, "mergerfs_config.pools"));
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["mergerfs"]));
        for pool in &config.pools {
            if pool.sources.is_empty() {
                return Err(ConfigError::invalid(
                    NAME,
                    "mergerfs_config.pools.sources",
                    format!("pool '{}' has no sources", pool.name),
                ));
            }
            add_mount(&mut plan, &pool.mount_point, pool.fstab_line());
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

    #[test]
    fn test_pool_fstab_and_mount() {
        let host = FakeHost::new("h");
        let plan = build(
            &Mergerfs,
            json!({"mergerfs_config": {
                "pools": [{
                    "name": "storage",
                    "sources": ["/mnt/disk1", "/mnt/disk2"],
                    "mount_point": "/mnt/storage",
                    "options": "cache.files=off,category.create=mfs"
                }],
                "nfs_export": {"enabled": false}
            }}),
        )
        .unwrap();

        assert_idempotent(&plan, &host);
        assert_eq!(
            host.file_text("/etc/fstab").unwrap(),
            "/mnt/disk1:/mnt/disk2 /mnt/storage mergerfs cache.files=off,category.create=mfs 0 0\n"
        );
        host.with_state(|s| {
            assert!(s.packages.contains_key("mergerfs"));
            assert_eq!(s.mounts[0].fstype, "mergerfs");
        });
    }

    #[test]
    fn test_pools_required() {
        assert_eq!(
            build(&Mergerfs, json!({"mergerfs_config": {}})).unwrap_err(),
            ConfigError::missing(NAME, "mergerfs_config.pools")
        );
        assert!(matches!(
            build(&Mergerfs, json!({"mergerfs_config": {"pools": [{"name": "p", "sources": []}]}}))
                .unwrap_err(),
            ConfigError::Missing { .. }
        ));
    }
}
