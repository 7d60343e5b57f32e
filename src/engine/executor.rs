//! Run engine - converges hosts wave by wave, hosts in parallel

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Local, Utc};
use colored::Colorize;
use declarative::{
    ApplyResult, AutoConfirm, AutoDecline, ConfirmCallback, Error, ExecuteOptions,
    ExecuteSummary, Host, ModuleReport, ProgressCallback, execute_plan,
};
use indicatif::MultiProgress;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::planner::{PlannedModule, build_plans, hold_back, waves};
use crate::config::Settings;
use crate::host::{HostFacts, ShellHost};
use crate::inventory::HostConfig;
use crate::modules::{ProvisionModule, k3s};
use crate::progress::{self, HostProgress};
use crate::secrets::SecretDecryptor;
use crate::ui;

/// Options for `apply`
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Probe only; report what would change
    pub dry_run: bool,
    /// Hosts converged in parallel
    pub jobs: usize,
    /// Skip confirmation of destructive operations
    pub yes: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: crate::config::DEFAULT_JOBS,
            yes: false,
            verbose: false,
            quiet: false,
        }
    }
}

/// Outcome of one host
#[derive(Debug, Serialize)]
pub struct HostReport {
    pub host: String,
    pub wave: usize,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub facts: Option<HostFacts>,
    /// Connection or fact gathering failure; no module ran
    pub error: Option<String>,
    pub modules: Vec<ModuleReport>,
}

impl HostReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.modules.iter().all(ModuleReport::is_success)
    }

    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for module in &self.modules {
            summary.merge(&module.summary());
        }
        summary
    }
}

/// Outcome of a whole `apply`
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub dry_run: bool,
    pub hosts: Vec<HostReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.hosts.iter().all(HostReport::is_success)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(path, json).with_context(|| format!("Could not write {}", path.display()))?;
        Ok(())
    }

    /// `run-<timestamp>.json` inside `dir`
    pub fn default_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("run-{}.json", self.started.format("%Y%m%dT%H%M%SZ")))
    }
}

/// Asks on the terminal, pausing the progress bars meanwhile
struct PromptConfirm {
    multi: MultiProgress,
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let answer = self.multi.suspend(|| {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })?;
        Ok(answer)
    }
}

type Confirmer = Mutex<Box<dyn ConfirmCallback>>;

fn confirmer(opts: &RunOptions, multi: &MultiProgress) -> Confirmer {
    let callback: Box<dyn ConfirmCallback> = if opts.yes || opts.dry_run {
        Box::new(AutoConfirm)
    } else if std::io::stdin().is_terminal() {
        Box::new(PromptConfirm {
            multi: multi.clone(),
        })
    } else {
        log::warn!("stdin is not a terminal; destructive operations will be refused without --yes");
        Box::new(AutoDecline)
    };
    Mutex::new(callback)
}

/// Descriptions of destructive operations that would actually run
fn pending_destructive(plan: &declarative::ModulePlan, host: &dyn Host) -> Vec<String> {
    plan.operations
        .iter()
        .filter(|op| op.destructive())
        .filter(|op| !op.probe(host).is_ok_and(|state| state.is_match()))
        .map(|op| op.description())
        .collect()
}

fn ask(confirm: &Confirmer, prompt: &str) -> bool {
    let mut callback = match confirm.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match callback.confirm(prompt) {
        Ok(answer) => answer,
        Err(e) => {
            log::warn!("Confirmation failed: {}", e);
            false
        }
    }
}

/// Run the planned modules on one host, in order
///
/// A module that failed to build or was not confirmed is recorded as failed;
/// later modules still run.
pub fn converge(
    host: &dyn Host,
    planned: Vec<PlannedModule>,
    opts: &RunOptions,
    progress: &mut dyn ProgressCallback,
    confirm: &Confirmer,
) -> Vec<ModuleReport> {
    let exec = ExecuteOptions {
        dry_run: opts.dry_run,
        verbose: opts.verbose,
    };

    planned
        .into_iter()
        .map(|planned| match planned {
            PlannedModule::Rejected { module, error } => {
                log::warn!("{}: {}", host.name(), error);
                progress.on_module_complete(module, false);
                ModuleReport::failed(module, error.into())
            }
            PlannedModule::Ready(plan) => {
                if !opts.dry_run {
                    let destructive = pending_destructive(&plan, host);
                    if !destructive.is_empty() {
                        let prompt = format!(
                            "{}: {} will {}. Continue?",
                            host.name(),
                            plan.module,
                            destructive.join(", ")
                        );
                        if !ask(confirm, &prompt) {
                            progress.on_module_complete(&plan.module, false);
                            return ModuleReport::failed(
                                &plan.module,
                                Error::ValidationGuard {
                                    operation: plan.module.clone(),
                                    reason: "destructive operations were not confirmed".to_string(),
                                },
                            );
                        }
                    }
                }
                execute_plan(&plan, host, &exec, progress)
            }
        })
        .collect()
}

struct RunContext<'a> {
    settings: &'a Settings,
    secrets: &'a dyn SecretDecryptor,
    modules: &'a [Box<dyn ProvisionModule>],
    explicit: bool,
    opts: &'a RunOptions,
    multi: &'a MultiProgress,
    confirm: &'a Confirmer,
}

/// Why later waves must not join the cluster, if a cluster-init host failed
fn cluster_init_failure(reports: &[HostReport]) -> Option<String> {
    reports.iter().find_map(|report| {
        if let Some(error) = &report.error {
            return Some(format!(
                "cluster-init host {} is unreachable: {}",
                report.host, error
            ));
        }
        report
            .modules
            .iter()
            .find(|m| m.module == k3s::NAME && !m.is_success())
            .map(|_| format!("k3s did not converge on cluster-init host {}", report.host))
    })
}

fn converge_host(
    config: &HostConfig,
    wave: usize,
    held: Option<&str>,
    ctx: &RunContext,
) -> HostReport {
    let started = Utc::now();
    let mut bar = HostProgress::new(ctx.multi, &config.name);
    bar.status("gathering facts");

    let host = ShellHost::connect(config, ctx.settings);
    let mut report = HostReport {
        host: config.name.clone(),
        wave,
        started,
        finished: started,
        facts: None,
        error: None,
        modules: Vec::new(),
    };

    match host.gather_facts() {
        Ok(facts) => {
            let planned = hold_back(
                build_plans(config, &facts, ctx.secrets, ctx.modules, ctx.explicit),
                held,
            );
            report.modules = converge(&host, planned, ctx.opts, &mut bar, ctx.confirm);
            report.facts = Some(facts);
        }
        Err(e) => {
            log::error!("{}: {}", config.name, e);
            bar.fail("unreachable");
            report.error = Some(e.to_string());
        }
    }

    bar.finish();
    report.finished = Utc::now();
    report
}

/// Converge `hosts`; waves run one after another, hosts within a wave in parallel
pub fn run(
    hosts: Vec<HostConfig>,
    modules: &[Box<dyn ProvisionModule>],
    explicit: bool,
    settings: &Settings,
    secrets: &dyn SecretDecryptor,
    opts: &RunOptions,
) -> Result<RunReport> {
    let started = Utc::now();
    let multi = progress::multi(opts.quiet);
    let confirm = confirmer(opts, &multi);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs.max(1))
        .build()
        .context("Failed to create host thread pool")?;

    let ctx = RunContext {
        settings,
        secrets,
        modules,
        explicit,
        opts,
        multi: &multi,
        confirm: &confirm,
    };

    let mut reports = Vec::new();
    let mut held: Option<String> = None;
    let waves = waves(hosts);
    let count = waves.len();
    for (index, wave) in waves.iter().enumerate() {
        log::info!(
            "Wave {}/{}: {}",
            index + 1,
            count,
            wave.iter().map(|h| h.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        let wave_reports: Vec<HostReport> = pool.install(|| {
            wave.par_iter()
                .map(|host| converge_host(host, index, held.as_deref(), &ctx))
                .collect()
        });
        if held.is_none() {
            held = cluster_init_failure(&wave_reports);
            if let Some(reason) = &held {
                log::error!("Holding back k3s on later waves: {}", reason);
            }
        }
        reports.extend(wave_reports);
    }

    Ok(RunReport {
        started,
        finished: Utc::now(),
        dry_run: opts.dry_run,
        hosts: reports,
    })
}

/// Print the per-host summary table
pub fn print_summary(report: &RunReport) {
    println!();
    for host in &report.hosts {
        let summary = host.summary();
        let symbol = if host.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        let seconds = (host.finished - host.started).num_milliseconds() as f64 / 1000.0;
        println!(
            "  {} {:<28} {} changed, {} unchanged, {} failed, {} handlers {}",
            symbol,
            host.host.bold(),
            summary.changed.to_string().yellow(),
            summary.unchanged,
            summary.failed.to_string().red(),
            summary.handlers,
            format!("({:.1}s)", seconds).dimmed()
        );
        if let Some(error) = &host.error {
            println!("      {}", error.red());
        }
        for module in &host.modules {
            for step in module
                .steps
                .iter()
                .filter(|s| !matches!(s.result, ApplyResult::Unchanged))
            {
                println!(
                    "      {} {} {}",
                    ui::result_symbol(&step.result),
                    module.module.dimmed(),
                    step.description
                );
            }
            if let Some(error) = &module.error {
                println!(
                    "      {} [{}] {}",
                    module.module.bold(),
                    error.category(),
                    error.to_string().red()
                );
            }
        }
    }

    let finished = report.finished.with_timezone(&Local);
    println!();
    if report.dry_run {
        println!("  {} Dry run - no changes made", "ℹ".blue());
    }
    let verdict = if report.is_success() {
        "All hosts converged".green().bold()
    } else {
        "Some hosts failed".yellow().bold()
    };
    println!(
        "  {} {}",
        verdict,
        format!("at {}", finished.format("%Y-%m-%d %H:%M:%S")).dimmed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::k3s::K3s;
    use crate::modules::raspberry::Raspberry;
    use crate::modules::sudoers::Sudoers;
    use crate::modules::testutil::build;
    use crate::modules::ConfigError;
    use declarative::NoProgress;
    use declarative::testing::FakeHost;
    use serde_json::json;

    fn nvme_plan() -> PlannedModule {
        PlannedModule::Ready(
            build(
                &Raspberry,
                json!({"raspberry_pi": {"nvme_boot": {"enabled": true, "clone_to_nvme": false}}}),
            )
            .unwrap(),
        )
    }

    fn decline() -> Confirmer {
        Mutex::new(Box::new(AutoDecline))
    }

    #[test]
    fn test_destructive_needs_confirmation() {
        let host = FakeHost::new("pi");
        host.put_file("/boot/firmware/cmdline.txt", "console=tty1 rootwait\n");

        let reports = converge(
            &host,
            vec![nvme_plan()],
            &RunOptions::default(),
            &mut NoProgress,
            &decline(),
        );
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error.as_ref().unwrap().category(), "guard");
        assert!(host.calls().is_empty());

        let accept: Confirmer = Mutex::new(Box::new(AutoConfirm));
        let reports = converge(&host, vec![nvme_plan()], &RunOptions::default(), &mut NoProgress, &accept);
        assert!(reports[0].is_success(), "{:?}", reports[0].error);
        assert_eq!(host.run_count("mklabel msdos"), 1);
    }

    #[test]
    fn test_satisfied_destructive_ops_do_not_prompt() {
        let host = FakeHost::new("pi");
        host.put_file("/boot/firmware/cmdline.txt", "console=tty1 rootwait\n");
        host.respond("blkid", declarative::CommandOutput::ok(""));

        let reports = converge(&host, vec![nvme_plan()], &RunOptions::default(), &mut NoProgress, &decline());
        assert!(reports[0].is_success(), "{:?}", reports[0].error);
        assert_eq!(host.run_count("mklabel"), 0);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let host = FakeHost::new("pi");
        host.put_file("/etc/sudoers", "root ALL=(ALL:ALL) ALL\n");
        let plan = build(&Sudoers, json!({"sudoers": {"user": "admin"}})).unwrap();
        let opts = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let reports = converge(&host, vec![PlannedModule::Ready(plan), nvme_plan()], &opts, &mut NoProgress, &decline());
        assert!(reports.iter().all(ModuleReport::is_success));
        assert!(host.calls().is_empty());
        assert_eq!(reports[0].summary().skipped, 1);
    }

    #[test]
    fn test_rejected_module_does_not_stop_the_host() {
        let host = FakeHost::new("pi");
        host.put_file("/etc/sudoers", "root ALL=(ALL:ALL) ALL\n");
        let planned = vec![
            PlannedModule::Rejected {
                module: "zfs",
                error: ConfigError::missing("zfs", "zfs_config"),
            },
            PlannedModule::Ready(build(&Sudoers, json!({"sudoers": {"user": "admin"}})).unwrap()),
        ];

        let reports = converge(&host, planned, &RunOptions::default(), &mut NoProgress, &decline());
        assert_eq!(reports[0].error.as_ref().unwrap().category(), "configuration");
        assert!(reports[1].is_success());
        assert!(host.file_text("/etc/sudoers").unwrap().contains("admin ALL=(ALL) NOPASSWD: ALL"));
    }

    fn host_report(host: &str, error: Option<&str>, modules: Vec<ModuleReport>) -> HostReport {
        let now = Utc::now();
        HostReport {
            host: host.into(),
            wave: 0,
            started: now,
            finished: now,
            facts: None,
            error: error.map(String::from),
            modules,
        }
    }

    #[test]
    fn test_failed_cluster_init_holds_back_k3s() {
        let failed = host_report(
            "vulkan",
            None,
            vec![ModuleReport::failed(
                "k3s",
                Error::Operation {
                    operation: "k3s:install".into(),
                    reason: "install script exited 1".into(),
                },
            )],
        );
        let reason = cluster_init_failure(&[failed]).unwrap();
        assert!(reason.contains("vulkan"));

        let host = FakeHost::new("apollo");
        host.put_file("/etc/sudoers", "root ALL=(ALL:ALL) ALL\n");
        let agent = build(
            &K3s,
            json!({"k3s_cluster": {"node_role": "agent", "api_host": "vulkan", "token": "t"}}),
        )
        .unwrap();
        let sudoers = build(&Sudoers, json!({"sudoers": {"user": "admin"}})).unwrap();
        let planned = hold_back(
            vec![PlannedModule::Ready(agent), PlannedModule::Ready(sudoers)],
            Some(&reason),
        );

        let reports = converge(&host, planned, &RunOptions::default(), &mut NoProgress, &decline());
        assert_eq!(reports[0].module, "k3s");
        assert_eq!(reports[0].error.as_ref().unwrap().category(), "guard");
        assert!(reports[1].is_success(), "{:?}", reports[1].error);
        assert_eq!(host.run_count("k3s"), 0);
    }

    #[test]
    fn test_unreachable_cluster_init_holds_back() {
        let reason = cluster_init_failure(&[host_report("vulkan", Some("Connection refused"), vec![])]);
        assert!(reason.unwrap().contains("unreachable"));

        let converged = host_report("vulkan", None, vec![ModuleReport::failed(
            "sudoers",
            ConfigError::missing("sudoers", "sudoers.user").into(),
        )]);
        assert_eq!(cluster_init_failure(&[converged]), None);
    }

    #[test]
    fn test_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let report = RunReport {
            started: now,
            finished: now,
            dry_run: false,
            hosts: vec![HostReport {
                host: "apollo".into(),
                wave: 0,
                started: now,
                finished: now,
                facts: None,
                error: Some("ssh: connect to host apollo port 22: Connection refused".into()),
                modules: vec![ModuleReport::failed(
                    "k3s",
                    ConfigError::missing("k3s", "k3s_cluster.token").into(),
                )],
            }],
        };
        assert!(!report.is_success());

        let path = report.default_path(&dir.path().join("reports"));
        report.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["hosts"][0]["host"], "apollo");
        assert_eq!(
            value["hosts"][0]["modules"][0]["error"],
            "k3s: required key 'k3s_cluster.token' is missing"
        );
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("run-"));
    }
}
