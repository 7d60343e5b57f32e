//! k3s - cluster node requirements, binary, service and kubeconfig
//!
//! Three roles share one module. `cluster-init` bootstraps the embedded etcd
//! and owns the kubeconfig handed back to the operator; `server` joins as an
//! additional control-plane node; `agent` joins as a worker.

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{BuildContext, ConfigError, ProvisionModule, SYSTEMD_DIR, UnitFile, continued, exec_word};
use crate::inventory::HostConfig;
use crate::resource::{
    AptPackages, Command, Condition, Directory, Download, FetchFile, FileContent, FileReplace,
    KernelModule, ServiceState, Sysctl, quote,
};

pub const NAME: &str = "k3s";
const UNIT: &str = "k3s.service";
const CONFIG_DIR: &str = "/etc/rancher/k3s";
const INSTALL_SCRIPT: &str = "/usr/local/bin/k3s-install.sh";
const ENV_FILE: &str = "/etc/systemd/system/k3s.service.env";

const STORAGE_PACKAGES: &[&str] = &["nfs-common", "open-iscsi", "cryptsetup", "dmsetup"];
const KERNEL_MODULES: &[&str] = &["iscsi_tcp", "dm_crypt"];
const MULTIPATH_UNITS: &[&str] = &["multipathd.socket", "multipathd"];
const SYSCTLS: &[(&str, u32)] = &[
    ("fs.inotify.max_user_instances", 1024),
    ("fs.inotify.max_user_watches", 32768),
    ("fs.inotify.max_queued_events", 32768),
    ("net.ipv4.ip_forward", 1),
    ("net.ipv6.conf.all.forwarding", 1),
    ("fs.file-max", 65536),
];

const REGISTRIES: &str = "mirrors:\n  docker.io:\n  ghcr.io:\n";
const KUBELET_CONFIG: &str = "apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
maxPods: 250
shutdownGracePeriod: 45s
shutdownGracePeriodCriticalPods: 30s
";
const SERVER_CONFIG: &str = "write-kubeconfig-mode: \"0644\"\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ClusterInit,
    #[default]
    Server,
    Agent,
}

impl NodeRole {
    fn is_server(self) -> bool {
        self != Self::Agent
    }
}

#[derive(Debug, Deserialize)]
struct K3sConfig {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node_role: NodeRole,
    api_host: String,
    #[serde(default = "default_api_port")]
    api_port: u16,
    token: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_disable")]
    disable: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    taints: Vec<Taint>,
    #[serde(default)]
    etcd_s3_snapshots: Option<EtcdS3>,
    #[serde(default)]
    etcd_snapshots: Option<EtcdSnapshots>,
    /// Local directory receiving `kubeconfig-<name>.yaml`
    #[serde(default = "default_kubeconfig_dir")]
    kubeconfig_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Taint {
    key: String,
    #[serde(default)]
    value: Option<String>,
    effect: String,
}

#[derive(Debug, Deserialize)]
struct EtcdS3 {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    secret_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdSnapshots {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    schedule_cron: Option<String>,
    #[serde(default)]
    retention: Option<u32>,
    #[serde(default)]
    s3_retention: Option<u32>,
    #[serde(default)]
    compress: bool,
}

fn default_api_port() -> u16 {
    6443
}

fn default_version() -> String {
    "v1.32.3+k3s1".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/rancher/k3s".to_string()
}

fn default_disable() -> Vec<String> {
    vec![
        "servicelb".to_string(),
        "traefik".to_string(),
        "local-storage".to_string(),
    ]
}

fn default_kubeconfig_dir() -> PathBuf {
    PathBuf::from(".")
}

fn flag(name: &str, value: impl AsRef<str>) -> String {
    format!("--{}={}", name, value.as_ref())
}

impl K3sConfig {
    fn api_url(&self) -> String {
        format!("https://{}:{}", self.api_host, self.api_port)
    }

    /// Arguments following `k3s server` / `k3s agent`
    fn args(&self) -> Vec<String> {
        let mut args = vec![flag("data-dir", &self.data_dir)];
        let role = self.node_role;

        if role.is_server() && !self.disable.is_empty() {
            args.push(flag("disable", self.disable.join(",")));
        }
        match role {
            NodeRole::ClusterInit => {
                args.push("--cluster-init".to_string());
                args.push(flag("tls-san", &self.api_host));
            }
            NodeRole::Server | NodeRole::Agent => args.push(flag("server", self.api_url())),
        }

        if role.is_server() {
            args.push(flag("secrets-encryption", "true"));
            args.push("--embedded-registry".to_string());
            args.push(flag(
                "kubelet-arg",
                format!("config={}/kubelet-server.config", CONFIG_DIR),
            ));

            if let Some(s3) = self.etcd_s3_snapshots.as_ref().filter(|s| s.enabled) {
                args.push("--etcd-s3".to_string());
                if let Some(secret) = &s3.secret_name {
                    args.push(flag("etcd-s3-config-secret", secret));
                }
            }
            if let Some(snapshots) = self.etcd_snapshots.as_ref().filter(|s| s.enabled) {
                if let Some(cron) = &snapshots.schedule_cron {
                    args.push(flag("etcd-snapshot-schedule-cron", cron));
                }
                if let Some(retention) = snapshots.retention {
                    args.push(flag("etcd-snapshot-retention", retention.to_string()));
                }
                if let Some(retention) = snapshots.s3_retention {
                    args.push(flag("etcd-s3-retention", retention.to_string()));
                }
                if snapshots.compress {
                    args.push("--etcd-snapshot-compress".to_string());
                }
            }
        }

        for (key, value) in &self.labels {
            args.push(flag("node-label", format!("{}={}", key, value)));
        }
        for taint in &self.taints {
            let spec = match &taint.value {
                Some(value) => format!("{}={}:{}", taint.key, value, taint.effect),
                None => format!("{}:{}", taint.key, taint.effect),
            };
            args.push(flag("node-taint", spec));
        }
        args
    }

    fn unit(&self) -> String {
        let subcommand = if self.node_role.is_server() {
            "server"
        } else {
            "agent"
        };
        let mut exec = vec![format!("/usr/local/bin/k3s {}", subcommand)];
        exec.extend(self.args().iter().map(|a| exec_word(a)));

        UnitFile::service("Lightweight Kubernetes")
            .wants("network-online.target")
            .after("network-online.target")
            .set(
                "Type",
                if self.node_role.is_server() {
                    "notify"
                } else {
                    "exec"
                },
            )
            .set("EnvironmentFile", format!("-{}", ENV_FILE))
            .set("KillMode", "process")
            .set("Delegate", "yes")
            .set("LimitNOFILE", "1048576")
            .set("LimitNPROC", "infinity")
            .set("LimitCORE", "infinity")
            .set("TasksMax", "infinity")
            .set("TimeoutStartSec", "0")
            .set("Restart", "always")
            .set("RestartSec", "5s")
            .set("ExecStartPre", "-/sbin/modprobe br_netfilter")
            .set("ExecStartPre", "-/sbin/modprobe overlay")
            .set("ExecStart", continued(&exec))
            .render()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_host.trim().is_empty() {
            return Err(ConfigError::missing(NAME, "k3s_cluster.api_host"));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::missing(NAME, "k3s_cluster.token"));
        }
        if self.node_role == NodeRole::ClusterInit
            && self.name.as_deref().is_none_or(|n| n.trim().is_empty())
        {
            return Err(ConfigError::missing(NAME, "k3s_cluster.name"));
        }
        for taint in &self.taints {
            if !["NoSchedule", "PreferNoSchedule", "NoExecute"].contains(&taint.effect.as_str()) {
                return Err(ConfigError::invalid(
                    NAME,
                    "k3s_cluster.taints.effect",
                    format!("unknown taint effect '{}'", taint.effect),
                ));
            }
        }
        Ok(())
    }
}

/// Whether the host bootstraps its cluster (deployment wave 0)
pub fn is_cluster_init(host: &HostConfig) -> bool {
    host.block("k3s_cluster.node_role")
        .and_then(serde_json::Value::as_str)
        == Some("cluster-init")
}

pub struct K3s;

impl K3s {
    fn requirements(plan: &mut ModulePlan) {
        plan.add(AptPackages::new(STORAGE_PACKAGES));
        for module in KERNEL_MODULES {
            plan.add(KernelModule::new(module));
        }
        for unit in MULTIPATH_UNITS {
            plan.add(ServiceState::stopped(unit));
        }
        for (key, value) in SYSCTLS {
            plan.add(Sysctl::persistent(key, value));
        }
        plan.add(Command::unless(
            "Disable UFW",
            "ufw disable",
            "! command -v ufw >/dev/null 2>&1 || ufw status | grep -q 'Status: inactive'",
        ));
    }

    fn install(plan: &mut ModulePlan, version: &str) -> String {
        plan.add(Download::root("https://get.k3s.io", INSTALL_SCRIPT, "0755"));
        plan.add(Command::new(
            format!("Install k3s {}", version),
            CommandSpec::root(INSTALL_SCRIPT)
                .env("INSTALL_K3S_SKIP_START", "true")
                .env("INSTALL_K3S_VERSION", version),
            Condition::UnlessOutputContains {
                command: CommandSpec::root("k3s --version"),
                needle: version.to_string(),
            },
        ))
    }

    fn kubeconfig(
        plan: &mut ModulePlan,
        config: &K3sConfig,
        home: &str,
    ) -> Result<(), ConfigError> {
        let copy = format!("{}/k3s.yaml", home);
        let kube_dir = format!("{}/.kube", home);
        let kubeconfig = format!("{}/config", kube_dir);
        plan.add(Command::creates(
            "Copy kubeconfig",
            format!(
                "cp {src}/k3s.yaml {copy} && mkdir -p {dir} && cp {copy} {cfg} && chmod 644 {cfg}",
                src = CONFIG_DIR,
                copy = quote(&copy),
                dir = quote(&kube_dir),
                cfg = quote(&kubeconfig),
            ),
            &copy,
        ));
        let pattern = Regex::new("https://.*")
            .map_err(|e| ConfigError::invalid(NAME, "k3s_cluster.api_host", e.to_string()))?;
        plan.add(FileReplace::new(
            FileSpec::plain(kubeconfig.clone()),
            pattern,
            config.api_url(),
        ));
        if config.node_role == NodeRole::ClusterInit
            && let Some(name) = &config.name
        {
            plan.add(FetchFile::new(
                kubeconfig,
                config.kubeconfig_dir.join(format!("kubeconfig-{}.yaml", name)),
            ));
        }
        Ok(())
    }
}

impl ProvisionModule for K3s {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "k3s_cluster"
    }

    fn description(&self) -> &'static str {
        "k3s node: requirements, binary, service unit and kubeconfig"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: K3sConfig = ctx.block(NAME, self.block())?;
        config.validate()?;
        let token = ctx.decrypt(NAME, &config.token)?;

        let mut plan = ModulePlan::new(NAME);
        Self::requirements(&mut plan);
        let install = Self::install(&mut plan, &config.version);

        let unit = plan.add(FileContent::new(
            FileSpec::root(format!("{}/{}", SYSTEMD_DIR, UNIT), "0755"),
            config.unit(),
        ));
        plan.add(Directory::new(FileSpec::root(CONFIG_DIR, "0755")));
        for (file, content) in [
            ("registries.yaml", REGISTRIES),
            ("kubelet-server.config", KUBELET_CONFIG),
            ("config-server.yaml", SERVER_CONFIG),
        ] {
            plan.add(FileContent::new(
                FileSpec::root(format!("{}/{}", CONFIG_DIR, file), "0644"),
                content,
            ));
        }
        let env = plan.add(FileContent::new(
            FileSpec::root(ENV_FILE, "0600"),
            format!("K3S_TOKEN={}\nK3S_VERSION={}\n", token, config.version),
        ));
        let service = plan.add(ServiceState::running(UNIT));

        let triggers = [install, unit, env, service];
        plan.notify(HandlerAction::DaemonReload, &triggers);
        plan.notify(HandlerAction::Restart(UNIT.to_string()), &triggers);

        if config.node_role.is_server() {
            Self::kubeconfig(&mut plan, &config, ctx.home())?;
        }
        Ok(plan)
    }
}
