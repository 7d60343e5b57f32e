//! nvidia - server driver, kernel modules and the container toolkit

use declarative::{FileSpec, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::{AptPackages, Command, Directory};

const NAME: &str = "nvidia";
const DEFAULT_DRIVER: &str = "580";
const KEYRINGS: &str = "/etc/apt/keyrings";
const GPG_KEY_URL: &str = "https://nvidia.github.io/libnvidia-container/gpgkey";
const SOURCE_LIST_URL: &str =
    "https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list";
const KEY_PATH: &str = "/etc/apt/keyrings/nvidia-container-toolkit.gpg";
const SOURCE_PATH: &str = "/etc/apt/sources.list.d/nvidia-container-toolkit.list";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NvidiaConfig {
    driver_version: String,
}

impl Default for NvidiaConfig {
    fn default() -> Self {
        Self {
            driver_version: DEFAULT_DRIVER.to_string(),
        }
    }
}

pub struct Nvidia;

impl ProvisionModule for Nvidia {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "nvidia"
    }

    fn description(&self) -> &'static str {
        "NVIDIA server driver and container runtime"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: NvidiaConfig = ctx.block_or_default(NAME, self.block())?;
        let version = config.driver_version.trim();
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::invalid(
                NAME,
                "nvidia.driver_version",
                format!("'{}' is not a driver branch number", version),
            ));
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&[format!(
            "linux-modules-nvidia-{}-server-generic",
            version
        )]));
        plan.add(Directory::new(FileSpec::root(KEYRINGS, "0755")));
        plan.add(Command::creates(
            "Install NVIDIA container toolkit key",
            format!("wget -q -O - {} | gpg --dearmor > {}", GPG_KEY_URL, KEY_PATH),
            KEY_PATH,
        ));
        plan.add(Command::creates(
            "Add NVIDIA container toolkit source",
            format!(
                "wget -q -O - {} | sed 's|^deb |deb [signed-by={}] |' > {}",
                SOURCE_LIST_URL, KEY_PATH, SOURCE_PATH
            ),
            SOURCE_PATH,
        ));
        plan.add(AptPackages::new(&[format!("nvidia-driver-{}-server", version)]).with_update());
        plan.add(AptPackages::new(&[
            "nvidia-container-runtime",
            "nvidia-container-toolkit",
        ]));
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::testing::FakeHost;
    use serde_json::json;

    fn host() -> FakeHost {
        let host = FakeHost::new("h");
        host.on_run("gpg --dearmor", |s| {
            s.files.insert(KEY_PATH.into(), Default::default());
        });
        host.on_run("nvidia-container-toolkit.list", |s| {
            s.files.insert(SOURCE_PATH.into(), Default::default());
        });
        host
    }

    #[test]
    fn test_default_driver_is_idempotent() {
        let host = host();
        let plan = build(&Nvidia, json!({"nvidia": {}})).unwrap();
        assert_idempotent(&plan, &host);

        host.with_state(|s| {
            assert!(s.packages.contains_key("linux-modules-nvidia-580-server-generic"));
            assert!(s.packages.contains_key("nvidia-driver-580-server"));
            assert!(s.packages.contains_key("nvidia-container-toolkit"));
        });
        assert_eq!(host.run_count("gpg --dearmor"), 1);
    }

    #[test]
    fn test_source_list_is_signed() {
        let plan = build(&Nvidia, json!({"nvidia": {"driver_version": "570"}})).unwrap();
        let host = host();
        run(&plan, &host);
        assert!(host.scripts().iter().any(|s| s.contains(
            "sed 's|^deb |deb [signed-by=/etc/apt/keyrings/nvidia-container-toolkit.gpg] |'"
        )));
        host.with_state(|s| assert!(s.packages.contains_key("nvidia-driver-570-server")));
    }

    #[test]
    fn test_rejects_bad_version() {
        assert!(matches!(
            build(&Nvidia, json!({"nvidia": {"driver_version": "latest"}})).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }
}
