//! disk-mounts - data disks mounted by UUID through /etc/fstab

use declarative::{FileSpec, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::{Directory, LineInFile, Mounted};

const NAME: &str = "disk-mounts";
pub const FSTAB: &str = "/etc/fstab";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskMount {
    uuid: String,
    mount: String,
    #[serde(default = "default_fstype")]
    fstype: String,
    #[serde(default = "default_options")]
    options: String,
}

fn default_fstype() -> String {
    "xfs".to_string()
}

pub(crate) fn default_options() -> String {
    "defaults".to_string()
}

/// fstab entry for a disk identified by filesystem UUID
fn fstab_line(disk: &DiskMount) -> String {
    format!(
        "/dev/disk/by-uuid/{} {} {} {} 0 0",
        disk.uuid, disk.mount, disk.fstype, disk.options
    )
}

/// Directory, fstab line and active mount for one mount point
pub(crate) fn add_mount(plan: &mut ModulePlan, mount_point: &str, fstab_entry: String) {
    plan.add(Directory::new(FileSpec::plain(mount_point)));
    plan.add(LineInFile::new(FileSpec::root(FSTAB, "0644"), fstab_entry).with_backup());
    plan.add(Mounted::new(mount_point));
}

pub struct DiskMounts;

impl ProvisionModule for DiskMounts {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "disk_mounts"
    }

    fn description(&self) -> &'static str {
        "Mount data disks by UUID"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let disks: Vec<DiskMount> = ctx.block(NAME, self.block())?;
        if disks.is_empty() {
            return Err(ConfigError::missing(NAME, "disk_mounts"));
        }

        let mut plan = ModulePlan::new(NAME);
        for disk in &disks {
            if disk.uuid.trim().is_empty() {
                return Err(ConfigError::missing(NAME, "disk_mounts.uuid"));
            }
            if !disk.mount.starts_with('/') {
                return Err(ConfigError::invalid(
                    NAME,
                    "disk_mounts.mount",
                    format!("'{}' is not an absolute path", disk.mount),
                ));
            }
            add_mount(&mut plan, &disk.mount, fstab_line(disk));
        }
        Ok(plan)
    }
}
