//! Disk wipe - the one operation that destroys data on purpose
//!
//! Guarded twice: the module refuses protected device names while building,
//! and the operation refuses at run time if the device (or any partition on
//! it) is mounted on a system path, or is not a block device at all.

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, CommandSpec, FactProbe, GuardViolation, Operation, ProbeError,
    ProbeState,
};

use super::quote;

/// Devices that normally hold the operating system
pub const PROTECTED_DEVICES: &[&str] = &["/dev/sda", "/dev/vda", "/dev/nvme0n1", "/dev/mmcblk0"];

/// Mount points that must never sit on a wiped device
pub const PROTECTED_MOUNT_PATHS: &[&str] = &[
    "/",
    "/boot",
    "/boot/efi",
    "/boot/firmware",
    "/home",
    "/var",
    "/usr",
];

/// Whether `device` names a protected disk
pub fn is_protected_device(device: &str) -> bool {
    PROTECTED_DEVICES.contains(&device.trim_end_matches('/'))
}

/// Whether a mount source lives on `device` (the disk itself or a partition)
///
/// btrfs subvolumes and bind mounts carry a `[/fsroot]` suffix, which is
/// ignored.
fn on_device(source: &str, device: &str) -> bool {
    let source = source.split_once('[').map_or(source, |(dev, _)| dev);
    match source.strip_prefix(device) {
        Some("") => true,
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Remove filesystem signatures and zero the start of a disk
#[derive(Debug, Clone)]
pub struct WipeDisk {
    pub device: String,
    pub zero_size_mb: u64,
}

impl WipeDisk {
    pub fn new(device: &str, zero_size_mb: u64) -> Self {
        Self {
            device: device.to_string(),
            zero_size_mb,
        }
    }

    /// Kernel name behind `/dev/disk/by-*` aliases and other symlinks
    fn resolve(&self, facts: &dyn FactProbe) -> Result<String, GuardViolation> {
        let out = facts
            .output(&CommandSpec::user(format!("readlink -f {}", quote(&self.device))))
            .map_err(|e| GuardViolation::new(format!("cannot resolve {}: {}", self.device, e)))?;
        let resolved = out.stdout_str().trim().to_string();
        if !out.success() || !resolved.starts_with("/dev/") {
            return Err(GuardViolation::new(format!(
                "cannot resolve {}: {}",
                self.device,
                out.stderr_str().trim()
            )));
        }
        if resolved != self.device {
            log::debug!("{} resolves to {}", self.device, resolved);
        }
        Ok(resolved)
    }

    fn script(&self) -> String {
        let dev = quote(&self.device);
        format!(
            "for part in {dev}?*; do [ -b \"$part\" ] && umount \"$part\" 2>/dev/null; done; \
             umount {dev} 2>/dev/null; \
             wipefs --all --force {dev} && \
             dd if=/dev/zero of={dev} bs=1M count={count} conv=fsync status=none",
            dev = dev,
            count = self.zero_size_mb
        )
    }
}

impl Operation for WipeDisk {
    fn id(&self) -> String {
        format!("wipe:{}", self.device)
    }

    fn description(&self) -> String {
        format!(
            "Wipe signatures on {} and zero the first {} MiB",
            self.device, self.zero_size_mb
        )
    }

    fn kind(&self) -> &'static str {
        "wipe"
    }

    fn guard(&self, facts: &dyn FactProbe) -> Result<(), GuardViolation> {
        if is_protected_device(&self.device) {
            return Err(GuardViolation::new(format!(
                "{} is a protected system device",
                self.device
            )));
        }

        let device = self.resolve(facts)?;
        if is_protected_device(&device) {
            return Err(GuardViolation::new(format!(
                "{} resolves to protected system device {}",
                self.device, device
            )));
        }

        let mounts = facts
            .mounts()
            .map_err(|e| GuardViolation::new(format!("cannot verify mounts: {}", e)))?;
        if let Some(m) = mounts.iter().find(|m| {
            on_device(&m.source, &device) && PROTECTED_MOUNT_PATHS.contains(&m.target.as_str())
        }) {
            return Err(GuardViolation::new(format!(
                "{} is mounted on protected path {}",
                m.source, m.target
            )));
        }

        let is_block = facts
            .block_device(&self.device)
            .map_err(|e| GuardViolation::new(format!("cannot inspect {}: {}", self.device, e)))?;
        if !is_block {
            return Err(GuardViolation::new(format!(
                "{} is not a block device",
                self.device
            )));
        }

        Ok(())
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let out = facts.output(&CommandSpec::root(format!(
            "wipefs --noheadings {}",
            quote(&self.device)
        )))?;
        if !out.success() {
            return Err(ProbeError::new(&self.device, out.stderr_str().trim()));
        }
        let signatures = out.stdout_str();
        Ok(if signatures.trim().is_empty() {
            ProbeState::Matches
        } else {
            ProbeState::differs(signatures.trim(), "no signatures")
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        log::warn!("Wiping {}", self.device);
        ctx.host.run(&CommandSpec::root(self.script()))?;
        Ok(ApplyResult::Changed)
    }

    fn destructive(&self) -> bool {
        true
    }
}
