//! nvme-power - keep NVMe drives and PCIe links out of power saving states

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::KernelParams;

const NAME: &str = "nvme-power";
const GRUB_DEFAULTS: &str = "/etc/default/grub";
const CMDLINE_VAR: &str = "GRUB_CMDLINE_LINUX_DEFAULT";

/// Disables APST on NVMe drives and ASPM on PCIe links
pub const PARAMS: &[&str] = &["nvme_core.default_ps_max_latency_us=0", "pcie_aspm=off"];

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NvmePowerConfig {
    extra_params: Vec<String>,
}

pub struct NvmePower;

impl ProvisionModule for NvmePower {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "nvme_power"
    }

    fn description(&self) -> &'static str {
        "Kernel parameters disabling NVMe APST and PCIe ASPM"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: NvmePowerConfig = ctx.block_or_default(NAME, self.block())?;
        let mut params: Vec<String> = PARAMS.iter().map(|p| p.to_string()).collect();
        params.extend(config.extra_params);

        let mut plan = ModulePlan::new(NAME);
        let grub = plan.add(
            KernelParams::assignment(FileSpec::root(GRUB_DEFAULTS, "0644"), CMDLINE_VAR, &params)
                .with_backup(),
        );
        plan.notify(
            HandlerAction::Run {
                name: "Regenerate GRUB configuration".to_string(),
                command: CommandSpec::root("update-grub"),
            },
            &[grub],
        );
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
    fn test_grub_params_with_backup() {
        let host = FakeHost::new("h");
        let original = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\n";
        host.put_file(GRUB_DEFAULTS, original);

        let plan = build(&NvmePower, json!({"nvme_power": {}})).unwrap();
        assert_idempotent(&plan, &host);

        assert_eq!(
            host.file_text(GRUB_DEFAULTS).unwrap(),
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash nvme_core.default_ps_max_latency_us=0 pcie_aspm=off\"\n"
        );
        assert_eq!(host.file_text("/etc/default/grub.bak").unwrap(), original);
        assert_eq!(host.run_count("update-grub"), 1);
    }

    #[test]
    fn test_missing_grub_fails() {
        let host = FakeHost::new("h");
        let plan = build(&NvmePower, json!({"nvme_power": {}})).unwrap();
        let report = run(&plan, &host);
        assert!(!report.is_success());
        assert_eq!(host.run_count("update-grub"), 0);
    }
}
