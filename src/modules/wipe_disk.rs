//! wipe-disk - erase filesystem signatures from a data disk
//!
//! Never part of a full run; it has to be named with `--module wipe-disk`
//! and the block has to carry `confirm_wipe = true`.

use declarative::ModulePlan;
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::{AptPackages, WipeDisk, is_protected_device};

const NAME: &str = "wipe-disk";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WipeConfig {
    path: String,
    #[serde(default)]
    confirm_wipe: bool,
    #[serde(default = "default_zero_size")]
    zero_size_mb: u64,
}

fn default_zero_size() -> u64 {
    100
}

pub struct WipeDiskModule;

impl ProvisionModule for WipeDiskModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "wipe_disk"
    }

    fn description(&self) -> &'static str {
        "Wipe signatures and zero the start of a disk (explicit only)"
    }

    fn run_by_default(&self) -> bool {
        false
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: WipeConfig = ctx.block(NAME, self.block())?;
        let path = config.path.trim();
        if path.is_empty() {
            return Err(ConfigError::missing(NAME, "wipe_disk.path"));
        }
        if !path.starts_with("/dev/") {
            return Err(ConfigError::invalid(
                NAME,
                "wipe_disk.path",
                format!("{} is not a device path", path),
            ));
        }
        if !config.confirm_wipe {
            return Err(ConfigError::guard(
                NAME,
                format!(
                    "wipe of {} not confirmed; set wipe_disk.confirm_wipe = true",
                    path
                ),
            ));
        }
        if is_protected_device(path) {
            return Err(ConfigError::guard(
                NAME,
                format!("{} is a protected system device", path),
            ));
        }
        if config.zero_size_mb == 0 {
            return Err(ConfigError::invalid(NAME, "wipe_disk.zero_size_mb", "must be at least 1"));
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["util-linux", "parted"]));
        plan.add(WipeDisk::new(path, config.zero_size_mb));
        Ok(plan)
    }
}
