//! raspberry - Raspberry Pi boot configuration
//!
//! Always enables the memory cgroup flags k3s needs on the kernel command
//! line. With `nvme_boot.enabled` it also turns on the PCIe lane, lays out
//! and formats an NVMe drive and clones the running SD card onto it.

use declarative::{CommandSpec, FileSpec, ModulePlan};
use regex::Regex;
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::{AptPackages, Command, Condition, KernelParams, LineInFile};

const NAME: &str = "raspberry";
const CMDLINE: &str = "/boot/firmware/cmdline.txt";
const CONFIG_TXT: &str = "/boot/firmware/config.txt";
const RPI_CLONE_URL: &str = "https://github.com/geerlingguy/rpi-clone.git";
const RPI_CLONE: &str = "/usr/local/bin/rpi-clone";
/// Written after a successful clone so it happens once per device
const CLONE_MARKER_DIR: &str = "/var/lib/hostwright";

pub const CGROUP_PARAMS: &[&str] = &[
    "cgroup_enable=cpuset",
    "cgroup_memory=1",
    "cgroup_enable=memory",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RaspberryConfig {
    nvme_boot: NvmeBoot,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NvmeBoot {
    enabled: bool,
    pcie_gen_speed: u8,
    set_boot_order: bool,
    clone_to_nvme: bool,
    nvme_device: String,
    boot_partition_size: String,
    root_partition_size: String,
}

impl Default for NvmeBoot {
    fn default() -> Self {
        Self {
            enabled: false,
            pcie_gen_speed: 2,
            set_boot_order: false,
            clone_to_nvme: true,
            nvme_device: "nvme0n1".to_string(),
            boot_partition_size: "512M".to_string(),
            root_partition_size: "128G".to_string(),
        }
    }
}

fn size_ok(size: &str) -> bool {
    let digits = size.trim_end_matches(['K', 'M', 'G', 'T']);
    !digits.is_empty() && digits.len() < size.len() && digits.chars().all(|c| c.is_ascii_digit())
}

impl NvmeBoot {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.nvme_device.is_empty()
            || !self
                .nvme_device
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ConfigError::invalid(
                NAME,
                "raspberry_pi.nvme_boot.nvme_device",
                format!("'{}' is not a device name like nvme0n1", self.nvme_device),
            ));
        }
        if !matches!(self.pcie_gen_speed, 1..=3) {
            return Err(ConfigError::invalid(
                NAME,
                "raspberry_pi.nvme_boot.pcie_gen_speed",
                "must be 1, 2 or 3",
            ));
        }
        for (key, size) in [
            ("boot_partition_size", &self.boot_partition_size),
            ("root_partition_size", &self.root_partition_size),
        ] {
            if !size_ok(size) {
                return Err(ConfigError::invalid(
                    NAME,
                    &format!("raspberry_pi.nvme_boot.{}", key),
                    format!("'{}' is not a size like 512M", size),
                ));
            }
        }
        Ok(())
    }

    fn device(&self) -> String {
        format!("/dev/{}", self.nvme_device)
    }

    fn partition(&self, n: u8) -> String {
        format!("{}p{}", self.device(), n)
    }

    /// Wipe, partition and format the drive; refuses while `/` lives on it
    fn partition_script(&self) -> String {
        let dev = self.device();
        let boot = &self.boot_partition_size;
        let root = &self.root_partition_size;
        [
            format!(
                "if findmnt -rno SOURCE / | grep -q '^{dev}'; then echo '{dev} holds the running root filesystem' >&2; exit 1; fi"
            ),
            format!("umount {dev}p* 2>/dev/null || true"),
            format!("wipefs -a {dev}"),
            format!("dd if=/dev/zero of={dev} bs=1M count=10 status=none"),
            format!("parted -s {dev} mklabel msdos"),
            format!("parted -s {dev} mkpart primary fat32 1MiB {boot}"),
            format!("parted -s {dev} set 1 boot on"),
            format!("parted -s {dev} mkpart primary ext4 {boot} {root}"),
            format!("parted -s {dev} mkpart primary ext4 {root} 100%"),
            "partprobe".to_string(),
            format!("mkfs.vfat -F 32 {}", self.partition(1)),
            format!("mkfs.ext4 -F {}", self.partition(2)),
            format!("mkfs.ext4 -F {}", self.partition(3)),
        ]
        .join(" && ")
    }

    /// Succeeds when the layout is already in place
    fn layout_check(&self) -> String {
        format!(
            "test -b {p3} && blkid -s TYPE -o value {p1} | grep -qx vfat && blkid -s TYPE -o value {p3} | grep -qx ext4",
            p1 = self.partition(1),
            p3 = self.partition(3)
        )
    }

    fn clone_marker(&self) -> String {
        format!("{}/rpi-clone-{}.done", CLONE_MARKER_DIR, self.nvme_device)
    }
}

pub struct Raspberry;

impl Raspberry {
    fn nvme_boot(plan: &mut ModulePlan, nvme: &NvmeBoot) -> Result<(), ConfigError> {
        nvme.validate()?;
        plan.add(AptPackages::new(&["git", "parted"]));

        let config_txt = FileSpec::plain(CONFIG_TXT);
        plan.add(LineInFile::new(config_txt.clone(), "dtparam=pciex1").with_backup());
        let gen_pattern = Regex::new(r"^dtparam=pciex1_gen=")
            .map_err(|e| ConfigError::invalid(NAME, "raspberry_pi.nvme_boot", e.to_string()))?;
        plan.add(
            LineInFile::new(
                config_txt,
                format!("dtparam=pciex1_gen={}", nvme.pcie_gen_speed),
            )
            .replacing(gen_pattern)
            .with_backup(),
        );

        if nvme.set_boot_order {
            plan.add(Command::unless(
                "Boot from NVMe first",
                "raspi-config nonint do_boot_order B2",
                "rpi-eeprom-config | grep -q '^BOOT_ORDER=0xf416'",
            ));
        }

        plan.add(
            Command::new(
                format!("Partition and format {}", nvme.device()),
                CommandSpec::root(nvme.partition_script()),
                Condition::Unless(CommandSpec::root(nvme.layout_check())),
            )
            .destructive(),
        );

        plan.add(Command::creates(
            "Install rpi-clone",
            format!(
                "rm -rf /tmp/rpi-clone && git clone --depth 1 {url} /tmp/rpi-clone && install -m 0755 /tmp/rpi-clone/rpi-clone {bin} && install -m 0755 /tmp/rpi-clone/rpi-clone-setup {bin}-setup",
                url = RPI_CLONE_URL,
                bin = RPI_CLONE
            ),
            RPI_CLONE,
        ));

        if nvme.clone_to_nvme {
            let marker = nvme.clone_marker();
            plan.add(
                Command::creates(
                    format!("Clone SD card to {}", nvme.device()),
                    format!(
                        "{} -u {} && mkdir -p {} && touch {}",
                        RPI_CLONE, nvme.nvme_device, CLONE_MARKER_DIR, marker
                    ),
                    &marker,
                )
                .destructive(),
            );
        }
        Ok(())
    }
}

impl ProvisionModule for Raspberry {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "raspberry_pi"
    }

    fn description(&self) -> &'static str {
        "Raspberry Pi cgroup flags and optional NVMe boot"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: RaspberryConfig = ctx.block_or_default(NAME, self.block())?;

        let mut plan = ModulePlan::new(NAME);
        plan.add(
            KernelParams::first_line(FileSpec::plain(CMDLINE), CGROUP_PARAMS).with_backup(),
        );
        if config.nvme_boot.enabled {
            Self::nvme_boot(&mut plan, &config.nvme_boot)?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::CommandOutput;
    use declarative::testing::FakeHost;
    use serde_json::json;

    const CMDLINE_TEXT: &str = "console=serial0,115200 console=tty1 root=PARTUUID=4e639091-02 rootfstype=ext4 rootwait\n";

    #[test]
    fn test_cgroup_flags() {
        let host = FakeHost::new("pi");
        host.put_file(CMDLINE, CMDLINE_TEXT);

        let plan = build(&Raspberry, json!({"raspberry_pi": {}})).unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert!(!plan.has_destructive());
        assert_idempotent(&plan, &host);

        assert_eq!(
            host.file_text(CMDLINE).unwrap(),
            "console=serial0,115200 console=tty1 root=PARTUUID=4e639091-02 rootfstype=ext4 rootwait cgroup_enable=cpuset cgroup_memory=1 cgroup_enable=memory\n"
        );
        assert_eq!(host.file_text("/boot/firmware/cmdline.txt.bak").unwrap(), CMDLINE_TEXT);
    }

    #[test]
    fn test_partition_layout() {
        let nvme = NvmeBoot::default();
        let script = nvme.partition_script();
        assert!(script.starts_with("if findmnt -rno SOURCE / | grep -q '^/dev/nvme0n1'"));
        assert!(script.contains("parted -s /dev/nvme0n1 mklabel msdos"));
        assert!(script.contains("mkpart primary fat32 1MiB 512M"));
        assert!(script.contains("mkpart primary ext4 512M 128G"));
        assert!(script.contains("mkpart primary ext4 128G 100%"));
        assert!(script.contains("mkfs.vfat -F 32 /dev/nvme0n1p1"));
        assert!(script.ends_with("mkfs.ext4 -F /dev/nvme0n1p3"));
    }

    #[test]
    fn test_nvme_boot_runs_once() {
        let host = FakeHost::new("pi");
        host.put_file(CMDLINE, CMDLINE_TEXT);
        host.put_file(CONFIG_TXT, "[all]\ndtparam=pciex1_gen=3\n");
        host.with_state(|s| {
            s.packages.insert("git".into(), "1:2.39".into());
            s.packages.insert("parted".into(), "3.5".into());
        });
        host.on_run("rpi-clone-setup", |s| {
            s.files.insert(RPI_CLONE.into(), Default::default());
        });
        host.on_run("rpi-clone -u nvme0n1", |s| {
            s.files
                .insert("/var/lib/hostwright/rpi-clone-nvme0n1.done".into(), Default::default());
        });

        let plan = build(
            &Raspberry,
            json!({"raspberry_pi": {"nvme_boot": {"enabled": true}}}),
        )
        .unwrap();
        assert!(plan.has_destructive());

        let report = run(&plan, &host);
        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(
            host.file_text(CONFIG_TXT).unwrap(),
            "[all]\ndtparam=pciex1_gen=2\ndtparam=pciex1\n"
        );
        assert_eq!(host.run_count("mklabel msdos"), 1);
        assert_eq!(host.run_count("rpi-clone -u nvme0n1"), 1);
        assert_eq!(host.run_count("do_boot_order"), 0);

        // the layout check now passes
        host.respond("blkid", CommandOutput::ok(""));
        run(&plan, &host);
        assert_eq!(host.run_count("mklabel msdos"), 1);
        assert_eq!(host.run_count("git clone"), 1);
        assert_eq!(host.run_count("rpi-clone -u nvme0n1"), 1);
    }

    #[test]
    fn test_rejects_bad_values() {
        for nvme in [
            json!({"enabled": true, "nvme_device": "/dev/nvme0n1"}),
            json!({"enabled": true, "pcie_gen_speed": 5}),
            json!({"enabled": true, "root_partition_size": "lots"}),
        ] {
            let err = build(&Raspberry, json!({"raspberry_pi": {"nvme_boot": nvme}})).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{:?}", err);
        }
        assert!(size_ok("512M"));
        assert!(!size_ok("512"));
        assert!(!size_ok("M"));
    }
}
