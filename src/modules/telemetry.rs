//! telemetry - Grafana Alloy shipping metrics to Mimir and logs to Loki

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::disk_health::SmartctlConfig;
use super::{BuildContext, ConfigError, ProvisionModule, SYSTEMD_DIR};
use crate::resource::{
    AptPackages, AptRepo, Command, Directory, FileContent, ServiceState,
};

const NAME: &str = "telemetry";
const UNIT: &str = "alloy.service";
const KEY_PATH: &str = "/etc/apt/keyrings/grafana.gpg";
const CONFIG_DIR: &str = "/etc/alloy";
const ENV_PATH: &str = "/etc/alloy/environment";
const CONFIG_PATH: &str = "/etc/alloy/config.alloy";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AlloyConfig {
    telemetry_host: String,
    mimir: Endpoint,
    loki: Endpoint,
    smartctl: SmartctlConfig,
}

impl Default for AlloyConfig {
    fn default() -> Self {
        Self {
            telemetry_host: "telemetry.example.net".to_string(),
            mimir: Endpoint::default(),
            loki: Endpoint::default(),
            smartctl: SmartctlConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Endpoint {
    port: Option<u16>,
    path: Option<String>,
}

impl Endpoint {
    fn url(&self, host: &str, port: u16, path: &str) -> String {
        format!(
            "http://{}:{}{}",
            host,
            self.port.unwrap_or(port),
            self.path.as_deref().unwrap_or(path)
        )
    }
}

impl AlloyConfig {
    fn mimir_endpoint(&self) -> String {
        self.mimir
            .url(&self.telemetry_host, 9090, "/api/v1/metrics/write")
    }

    fn loki_endpoint(&self) -> String {
        self.loki.url(&self.telemetry_host, 3100, "/loki/api/v1/push")
    }

    fn environment(&self, hostname: &str) -> String {
        format!(
            "HOSTNAME={}\nMIMIR_ENDPOINT={}\nLOKI_ENDPOINT={}\n",
            hostname,
            self.mimir_endpoint(),
            self.loki_endpoint()
        )
    }

    fn config_alloy(&self) -> String {
        let mut out = String::from(
            r#"// Managed by hostwright
logging {
  level = "info"
}

prometheus.exporter.unix "node" { }

prometheus.scrape "node" {
  targets    = prometheus.exporter.unix.node.targets
  forward_to = [prometheus.relabel.instance.receiver]
}
"#,
        );
        if self.smartctl.enabled {
            out.push_str(&format!(
                r#"
prometheus.scrape "smartctl" {{
  targets    = [{{"__address__" = "127.0.0.1:{}"}}]
  forward_to = [prometheus.relabel.instance.receiver]
}}
"#,
                self.smartctl.port
            ));
        }
        out.push_str(
            r#"
prometheus.relabel "instance" {
  forward_to = [prometheus.remote_write.mimir.receiver]

  rule {
    target_label = "instance"
    replacement  = sys.env("HOSTNAME")
  }
}

prometheus.remote_write "mimir" {
  endpoint {
    url = sys.env("MIMIR_ENDPOINT")
  }
}

loki.source.journal "journal" {
  forward_to = [loki.write.loki.receiver]
  labels     = {host = sys.env("HOSTNAME")}
}

loki.write "loki" {
  endpoint {
    url = sys.env("LOKI_ENDPOINT")
  }
}
"#,
        );
        out
    }
}

pub struct Telemetry;

impl ProvisionModule for Telemetry {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "alloy"
    }

    fn description(&self) -> &'static str {
        "Grafana Alloy agent for metrics and journal logs"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: AlloyConfig = ctx.block_or_default(NAME, self.block())?;
        if config.telemetry_host.trim().is_empty() {
            return Err(ConfigError::missing(NAME, "alloy.telemetry_host"));
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(Directory::new(FileSpec::root("/etc/apt/keyrings", "0755")));
        plan.add(Command::creates(
            "Install Grafana GPG key",
            format!(
                "wget -q -O - https://apt.grafana.com/gpg.key | gpg --dearmor > {}",
                KEY_PATH
            ),
            KEY_PATH,
        ));
        plan.add(AptRepo::new(
            "grafana",
            format!(
                "deb [signed-by={}] https://apt.grafana.com stable main",
                KEY_PATH
            ),
        ));
        plan.add(AptPackages::new(&["alloy"]).with_update());

        plan.add(Directory::new(FileSpec::root(CONFIG_DIR, "0755")));
        let env = plan.add(
            FileContent::new(
                FileSpec::root(ENV_PATH, "0644"),
                config.environment(&ctx.facts.hostname),
            )
            .with_backup(),
        );
        let alloy = plan.add(
            FileContent::new(FileSpec::root(CONFIG_PATH, "0644"), config.config_alloy())
                .with_backup(),
        );
        let override_dir = format!("{}/{}.d", SYSTEMD_DIR, UNIT);
        plan.add(Directory::new(FileSpec::root(override_dir.clone(), "0755")));
        let dropin = plan.add(FileContent::new(
            FileSpec::root(format!("{}/environment.conf", override_dir), "0644"),
            format!("[Service]\nEnvironmentFile={}\n", ENV_PATH),
        ));
        let service = plan.add(ServiceState::running(UNIT));

        plan.notify(
            HandlerAction::DaemonReload,
            &[env.clone(), alloy.clone(), dropin.clone(), service.clone()],
        );
        plan.notify(
            HandlerAction::Run {
                name: "Check Alloy configuration".to_string(),
                command: CommandSpec::root(format!("alloy fmt {}", CONFIG_PATH)),
            },
            &[alloy.clone()],
        );
        plan.notify(
            HandlerAction::Restart(UNIT.to_string()),
            &[env, alloy, dropin, service],
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::testing::{FakeHost, HostCall};
    use serde_json::json;

    fn alloy_host() -> FakeHost {
        let host = FakeHost::new("h");
        host.on_run("gpg --dearmor > /etc/apt/keyrings/grafana.gpg", |s| {
            s.files.insert(KEY_PATH.into(), Default::default());
        });
        host
    }

    #[test]
    fn test_defaults_and_handler_order() {
        let host = alloy_host();
        let plan = build(&Telemetry, json!({"alloy": {}})).unwrap();
        assert_idempotent(&plan, &host);

        assert_eq!(
            host.file_text(ENV_PATH).unwrap(),
            "HOSTNAME=apollo\n\
             MIMIR_ENDPOINT=http://telemetry.example.net:9090/api/v1/metrics/write\n\
             LOKI_ENDPOINT=http://telemetry.example.net:3100/loki/api/v1/push\n"
        );
        assert_eq!(
            host.file_text("/etc/systemd/system/alloy.service.d/environment.conf").unwrap(),
            "[Service]\nEnvironmentFile=/etc/alloy/environment\n"
        );
        assert!(host.file_text("/etc/apt/sources.list.d/grafana.list").is_some());

        let calls = host.calls();
        let position = |wanted: &HostCall| calls.iter().position(|c| c == wanted).unwrap();
        let reload = position(&HostCall::DaemonReload);
        let fmt = position(&HostCall::Run("alloy fmt /etc/alloy/config.alloy".into()));
        let restart = position(&HostCall::Restart(UNIT.into()));
        assert!(reload < fmt && fmt < restart);
    }

    #[test]
    fn test_custom_endpoints() {
        let config: AlloyConfig = serde_json::from_value(json!({
            "telemetry_host": "obs.internal",
            "mimir": {"port": 9009},
            "loki": {"path": "/push"}
        }))
        .unwrap();
        assert_eq!(
            config.mimir_endpoint(),
            "http://obs.internal:9009/api/v1/metrics/write"
        );
        assert_eq!(config.loki_endpoint(), "http://obs.internal:3100/push");
        assert!(!config.config_alloy().contains("smartctl"));
    }

    #[test]
    fn test_scrapes_disk_health_exporter() {
        let config: AlloyConfig =
            serde_json::from_value(json!({"smartctl": {"enabled": true}})).unwrap();
        assert!(
            config
                .config_alloy()
                .contains(r#"targets    = [{"__address__" = "127.0.0.1:9633"}]"#)
        );
    }

    #[test]
    fn test_config_edit_restores_file_and_restarts() {
        let host = alloy_host();
        let plan = build(&Telemetry, json!({"alloy": {}})).unwrap();
        run(&plan, &host);
        host.put_file(CONFIG_PATH, "// hand edited\n");

        let report = run(&plan, &host);
        assert_eq!(changes(&report), 1);
        assert_eq!(host.restarts(UNIT), 2);
        assert_eq!(host.run_count("alloy fmt"), 2);
        assert!(host.file_text("/etc/alloy/config.alloy.bak").unwrap().contains("hand edited"));
    }
}
