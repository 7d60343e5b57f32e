//! nfs - export mergerfs pools over NFS

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::inventory::HostConfig;
use crate::resource::{AptPackages, FileContent, ServiceState};

const NAME: &str = "nfs";
const EXPORTS: &str = "/etc/exports";

#[derive(Debug, Deserialize)]
struct NfsExportConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    exports: Vec<Export>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Export {
    mount_point: String,
    #[serde(default = "default_clients")]
    clients: String,
    #[serde(default = "default_export_options")]
    options: String,
}

fn default_clients() -> String {
    "*".to_string()
}

fn default_export_options() -> String {
    "rw,sync,no_subtree_check".to_string()
}

fn render_exports(exports: &[Export]) -> String {
    let mut out = String::from("# Managed by hostwright\n");
    for export in exports {
        out.push_str(&format!(
            "{} {}({})\n",
            export.mount_point, export.clients, export.options
        ));
    }
    out
}

pub struct Nfs;

impl ProvisionModule for Nfs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "mergerfs_config.nfs_export"
    }

    fn description(&self) -> &'static str {
        "NFS server exporting pooled storage"
    }

    fn applies(&self, host: &HostConfig) -> bool {
        host.block_enabled(self.block())
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: NfsExportConfig = ctx.block(NAME, self.block())?;
        if !config.enabled {
            return Err(ConfigError::invalid(
                NAME,
                "mergerfs_config.nfs_export.enabled",
                "NFS export is not enabled",
            ));
        }
        if config.exports.is_empty() {
            return Err(ConfigError::missing(NAME, "mergerfs_config.nfs_export.exports"));
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["nfs-kernel-server"]));
        let exports = plan.add(FileContent::new(
            FileSpec::root(EXPORTS, "0644"),
            render_exports(&config.exports),
        ));
        plan.add(ServiceState::running("nfs-server"));
        plan.notify(
            HandlerAction::Run {
                name: "Reload NFS exports".to_string(),
                command: CommandSpec::root("exportfs -ra"),
            },
            &[exports],
        );
        Ok(plan)
    }
}
