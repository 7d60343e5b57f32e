//! amd-gpu - expose the ROCm compute device to containers

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::FileContent;

const NAME: &str = "amd-gpu";
const RULES_PATH: &str = "/etc/udev/rules.d/99-amd-kfd.rules";
const RULES: &str = concat!(
    "SUBSYSTEM==\"kfd\", GROUP=\"render\", MODE=\"0666\", OPTIONS+=\"last_rule\"\n",
    "SUBSYSTEM==\"drm\", KERNEL==\"card[0-9]*\", GROUP=\"render\", MODE=\"0666\", OPTIONS+=\"last_rule\"\n",
);

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AmdGpuConfig {
    /// Extra rules appended after the KFD/DRM ones
    extra_rules: Vec<String>,
}

pub struct AmdGpu;

impl ProvisionModule for AmdGpu {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "amd_gpu"
    }

    fn description(&self) -> &'static str {
        "udev rules opening /dev/kfd and DRM cards to the render group"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: AmdGpuConfig = ctx.block_or_default(NAME, self.block())?;
        let mut rules = RULES.to_string();
        for rule in &config.extra_rules {
            rules.push_str(rule.trim_end());
            rules.push('\n');
        }

        let mut plan = ModulePlan::new(NAME);
        let rules_id = plan.add(FileContent::new(FileSpec::root(RULES_PATH, "0644"), rules));
        plan.notify(
            HandlerAction::Run {
                name: "Reload udev rules".to_string(),
                command: CommandSpec::root("udevadm control --reload-rules && udevadm trigger"),
            },
            &[rules_id],
        );
        Ok(plan)
    }
}
