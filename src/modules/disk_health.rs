//! disk-health - SMART metrics through smartctl_exporter

use declarative::{CommandSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule, UnitFile, continued, unit_spec};
use crate::inventory::HostConfig;
use crate::resource::{AptPackages, Command, Condition, FileContent, ServiceState};

const NAME: &str = "disk-health";
const VERSION: &str = "0.14.0";
const BINARY: &str = "/usr/local/bin/smartctl_exporter";
const UNIT: &str = "smartctl_exporter.service";

/// `alloy.smartctl`; the telemetry module reads the same block to scrape it
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmartctlConfig {
    pub enabled: bool,
    pub port: u16,
    pub interval: String,
    pub rescan_interval: String,
    /// Device name regex to skip; empty disables the filter
    pub device_exclude: String,
}

impl Default for SmartctlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9633,
            interval: "60s".to_string(),
            rescan_interval: "10m".to_string(),
            device_exclude: "^(loop|ram|sr)".to_string(),
        }
    }
}

impl SmartctlConfig {
    fn exec_start(&self) -> String {
        let mut parts = vec![
            BINARY.to_string(),
            format!("--web.listen-address=:{}", self.port),
            "--web.telemetry-path=/metrics".to_string(),
            "--smartctl.path=/usr/sbin/smartctl".to_string(),
            format!("--smartctl.interval={}", self.interval),
            format!("--smartctl.rescan={}", self.rescan_interval),
        ];
        if !self.device_exclude.is_empty() {
            parts.push(format!("--smartctl.device-exclude=\"{}\"", self.device_exclude));
        }
        continued(&parts)
    }
}

/// Release asset architecture for a `uname -m` value
fn release_arch(machine: &str) -> &'static str {
    match machine.to_lowercase().as_str() {
        "x86_64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "armv7l" => "armv7",
        "armv6l" => "armv6",
        "i386" | "i686" => "386",
        other => {
            log::warn!("Unknown architecture '{}', using amd64 exporter build", other);
            "amd64"
        }
    }
}

fn install_script(arch: &str) -> String {
    let dir = format!("smartctl_exporter-{}.linux-{}", VERSION, arch);
    let url = format!(
        "https://github.com/prometheus-community/smartctl_exporter/releases/download/v{}/{}.tar.gz",
        VERSION, dir
    );
    format!(
        "curl -fsSL {url} -o /tmp/{dir}.tar.gz && \
         tar xzf /tmp/{dir}.tar.gz -C /tmp && \
         install -m 755 /tmp/{dir}/smartctl_exporter {BINARY} && \
         rm -rf /tmp/smartctl_exporter*"
    )
}

pub struct DiskHealth;

impl ProvisionModule for DiskHealth {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "alloy.smartctl"
    }

    fn description(&self) -> &'static str {
        "smartctl_exporter service for disk health metrics"
    }

    fn applies(&self, host: &HostConfig) -> bool {
        host.block_enabled(self.block())
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: SmartctlConfig = ctx.block(NAME, self.block())?;
        if !config.enabled {
            return Err(ConfigError::invalid(
                NAME,
                "alloy.smartctl.enabled",
                "disk health exporter is not enabled",
            ));
        }
        let arch = release_arch(&ctx.facts.arch);

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["smartmontools"]).with_update());
        let install = plan.add(Command::new(
            format!("Install smartctl_exporter {} ({})", VERSION, arch),
            CommandSpec::root(install_script(arch)),
            Condition::UnlessOutputContains {
                command: CommandSpec::user(format!("{} --version 2>&1", BINARY)),
                needle: format!("version {}", VERSION),
            },
        ));
        let unit = UnitFile::service("Prometheus smartctl exporter")
            .wants("network-online.target")
            .after("network-online.target")
            .set("Type", "simple")
            .set("ExecStart", config.exec_start())
            .set("Restart", "on-failure")
            .set("RestartSec", "5s");
        let unit_id = plan.add(FileContent::new(unit_spec(UNIT), unit.render()).with_backup());
        let service = plan.add(ServiceState::running(UNIT));

        plan.notify(HandlerAction::DaemonReload, &[unit_id.clone(), service.clone()]);
        plan.notify(HandlerAction::Restart(UNIT.to_string()), &[unit_id, service, install]);
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

    /// A host with `installed` as the exporter's reported version
    fn exporter_host(installed: Option<&str>) -> FakeHost {
        let host = FakeHost::new("h");
        if let Some(version) = installed {
            host.respond(
                "smartctl_exporter --version",
                CommandOutput::ok(format!(
                    "smartctl_exporter, version {} (branch: HEAD, revision: 1c9f2b3)\n",
                    version
                )),
            );
        }
        host
    }

    #[test]
    fn test_default_listen_port() {
        let host = exporter_host(Some(VERSION));
        let plan = build(&DiskHealth, json!({"alloy": {"smartctl": {"enabled": true}}})).unwrap();
        assert_idempotent(&plan, &host);

        let unit = host.file_text("/etc/systemd/system/smartctl_exporter.service").unwrap();
        assert!(unit.contains("--web.listen-address=:9633"));
        assert!(unit.contains("--smartctl.interval=60s"));
        assert!(unit.contains("--smartctl.device-exclude=\"^(loop|ram|sr)\""));
        assert!(unit.contains("ExecStart=/usr/local/bin/smartctl_exporter \\\n    --web.listen-address"));
        assert_eq!(host.daemon_reloads(), 1);
        assert_eq!(host.restarts(UNIT), 1);
        assert_eq!(host.run_count("linux-amd64"), 0);
    }

    #[test]
    fn test_installs_missing_or_outdated_exporter() {
        let plan = build(&DiskHealth, json!({"alloy": {"smartctl": {"enabled": true}}})).unwrap();
        for installed in [None, Some("0.13.0")] {
            let host = exporter_host(installed);
            let report = run(&plan, &host);
            assert!(report.is_success(), "{:?}", report.error);
            assert_eq!(host.run_count("linux-amd64"), 1, "{:?}", installed);
            assert_eq!(host.restarts(UNIT), 1);
        }
    }

    #[test]
    fn test_custom_port_and_arm() {
        let config = SmartctlConfig {
            port: 9700,
            device_exclude: String::new(),
            ..SmartctlConfig::default()
        };
        let exec = config.exec_start();
        assert!(exec.contains("--web.listen-address=:9700"));
        assert!(!exec.contains("device-exclude"));
        assert_eq!(release_arch("aarch64"), "arm64");
        assert_eq!(release_arch("armv7l"), "armv7");
        assert!(install_script("arm64").contains(
            "/v0.14.0/smartctl_exporter-0.14.0.linux-arm64.tar.gz"
        ));
    }

    #[test]
    fn test_applies_only_when_enabled() {
        assert!(DiskHealth.applies(&host(json!({"alloy": {"smartctl": {"enabled": true}}}))));
        assert!(!DiskHealth.applies(&host(json!({"alloy": {"smartctl": {"port": 1}}}))));
        assert!(!DiskHealth.applies(&host(json!({"alloy": {}}))));
        assert!(build(&DiskHealth, json!({"alloy": {"smartctl": {}}})).is_err());
    }
}
