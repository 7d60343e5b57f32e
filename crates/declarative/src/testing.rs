//! In-memory host for tests
//!
//! `FakeHost` answers fact queries from a [`FakeState`] and applies every
//! mutation to that same state, so a plan executed twice against it behaves
//! like a plan executed twice against a real machine.

use crate::error::{ExecError, ProbeError};
use crate::facts::{DirectoryFact, FactProbe, FileFact, MountFact, ServiceFact, normalize_mode};
use crate::host::{CommandSpec, FileSpec, Host, HostExecutor, ServiceTarget};
use crate::types::CommandOutput;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Everything the fake host knows about itself
#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub files: BTreeMap<String, FileFact>,
    pub directories: BTreeMap<String, DirectoryFact>,
    pub packages: BTreeMap<String, String>,
    pub services: BTreeMap<String, ServiceFact>,
    pub sysctl: BTreeMap<String, String>,
    pub modules: BTreeSet<String>,
    pub zfs_pools: Vec<String>,
    pub zfs_datasets: BTreeMap<String, BTreeMap<String, String>>,
    pub mounts: Vec<MountFact>,
    pub block_devices: BTreeSet<String>,
}

/// A mutation recorded by the fake host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    WriteFile(String),
    Backup(String),
    CreateDir(String),
    Install(Vec<String>),
    SetService { unit: String, target: ServiceTarget },
    Restart(String),
    DaemonReload,
    Sysctl { key: String, value: String },
    LoadModule(String),
    Mount(String),
    Run(String),
}

impl fmt::Display for HostCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFile(path) => write!(f, "write {}", path),
            Self::Backup(path) => write!(f, "backup {}", path),
            Self::CreateDir(path) => write!(f, "mkdir {}", path),
            Self::Install(packages) => write!(f, "install {}", packages.join(" ")),
            Self::SetService { unit, target } => write!(
                f,
                "service {} enabled={:?} running={:?}",
                unit, target.enabled, target.running
            ),
            Self::Restart(unit) => write!(f, "restart {}", unit),
            Self::DaemonReload => write!(f, "daemon-reload"),
            Self::Sysctl { key, value } => write!(f, "sysctl {}={}", key, value),
            Self::LoadModule(name) => write!(f, "modprobe {}", name),
            Self::Mount(target) => write!(f, "mount {}", target),
            Self::Run(script) => write!(f, "run {}", script),
        }
    }
}

type Effect = Box<dyn Fn(&mut FakeState) + Send + Sync>;

/// In-memory implementation of [`Host`]
pub struct FakeHost {
    name: String,
    state: Mutex<FakeState>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    effects: Mutex<Vec<(String, Effect)>>,
    failures: Mutex<Vec<String>>,
    probe_failures: Mutex<Vec<String>>,
    calls: Mutex<Vec<HostCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeHost {
    /// An empty host
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FakeState::default()),
            responses: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            probe_failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Inspect or seed the state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Seed a file
    pub fn put_file(&self, path: &str, content: &str) {
        self.with_state(|s| {
            s.files.insert(
                path.to_string(),
                FileFact {
                    content: content.as_bytes().to_vec(),
                    ..Default::default()
                },
            );
        });
    }

    /// Content of a file, if present
    pub fn file_text(&self, path: &str) -> Option<String> {
        self.with_state(|s| s.files.get(path).map(FileFact::text))
    }

    /// Answer checks, outputs and runs whose script contains `pattern`
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        lock(&self.responses).push((pattern.to_string(), output));
    }

    /// Mutate the state when a run script contains `pattern`
    pub fn on_run(&self, pattern: &str, effect: impl Fn(&mut FakeState) + Send + Sync + 'static) {
        lock(&self.effects).push((pattern.to_string(), Box::new(effect)));
    }

    /// Fail any mutation whose rendering contains `pattern`
    pub fn fail_on(&self, pattern: &str) {
        lock(&self.failures).push(pattern.to_string());
    }

    /// Fail any fact query whose target contains `pattern`
    pub fn fail_probe(&self, pattern: &str) {
        lock(&self.probe_failures).push(pattern.to_string());
    }

    /// Every mutation in order
    pub fn calls(&self) -> Vec<HostCall> {
        lock(&self.calls).clone()
    }

    /// Number of `systemctl daemon-reload` calls
    pub fn daemon_reloads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::DaemonReload))
            .count()
    }

    /// Number of restarts of `unit`
    pub fn restarts(&self, unit: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Restart(u) if u == unit))
            .count()
    }

    /// Number of run commands whose script contains `pattern`
    pub fn run_count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Run(s) if s.contains(pattern)))
            .count()
    }

    /// Scripts of every run command
    pub fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Run(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: HostCall) -> Result<(), ExecError> {
        let rendered = call.to_string();
        lock(&self.calls).push(call);
        if lock(&self.failures).iter().any(|p| rendered.contains(p)) {
            return Err(ExecError::CommandFailed {
                command: rendered,
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn probe_target(&self, target: &str) -> Result<(), ProbeError> {
        if lock(&self.probe_failures).iter().any(|p| target.contains(p)) {
            return Err(ProbeError::new(target, "injected failure"));
        }
        Ok(())
    }

    fn response(&self, script: &str) -> Option<CommandOutput> {
        lock(&self.responses)
            .iter()
            .find(|(p, _)| script.contains(p.as_str()))
            .map(|(_, o)| o.clone())
    }
}

impl fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeHost").field("name", &self.name).finish()
    }
}

impl FactProbe for FakeHost {
    fn file(&self, path: &str) -> Result<Option<FileFact>, ProbeError> {
        self.probe_target(path)?;
        Ok(self.with_state(|s| s.files.get(path).cloned()))
    }

    fn directory(&self, path: &str) -> Result<Option<DirectoryFact>, ProbeError> {
        self.probe_target(path)?;
        Ok(self.with_state(|s| s.directories.get(path).cloned()))
    }

    fn package(&self, name: &str) -> Result<Option<String>, ProbeError> {
        self.probe_target(name)?;
        Ok(self.with_state(|s| s.packages.get(name).cloned()))
    }

    fn service(&self, unit: &str) -> Result<ServiceFact, ProbeError> {
        self.probe_target(unit)?;
        Ok(self.with_state(|s| s.services.get(unit).copied().unwrap_or_default()))
    }

    fn sysctl(&self, key: &str) -> Result<Option<String>, ProbeError> {
        self.probe_target(key)?;
        Ok(self.with_state(|s| s.sysctl.get(key).cloned()))
    }

    fn kernel_module(&self, name: &str) -> Result<bool, ProbeError> {
        self.probe_target(name)?;
        Ok(self.with_state(|s| s.modules.contains(name)))
    }

    fn zfs_pools(&self) -> Result<Vec<String>, ProbeError> {
        self.probe_target("zpool")?;
        Ok(self.with_state(|s| s.zfs_pools.clone()))
    }

    fn zfs_dataset(&self, name: &str) -> Result<Option<BTreeMap<String, String>>, ProbeError> {
        self.probe_target(name)?;
        Ok(self.with_state(|s| s.zfs_datasets.get(name).cloned()))
    }

    fn mounts(&self) -> Result<Vec<MountFact>, ProbeError> {
        self.probe_target("mounts")?;
        Ok(self.with_state(|s| s.mounts.clone()))
    }

    fn block_device(&self, path: &str) -> Result<bool, ProbeError> {
        self.probe_target(path)?;
        Ok(self.with_state(|s| s.block_devices.contains(path)))
    }

    fn check(&self, command: &CommandSpec) -> Result<bool, ProbeError> {
        self.probe_target(&command.script)?;
        Ok(self
            .response(&command.script)
            .is_some_and(|o| o.success()))
    }

    fn output(&self, command: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        self.probe_target(&command.script)?;
        Ok(self
            .response(&command.script)
            .unwrap_or_else(|| CommandOutput::failed(127, "command not found")))
    }
}

impl HostExecutor for FakeHost {
    fn write_file(&self, spec: &FileSpec, content: &[u8]) -> Result<(), ExecError> {
        self.record(HostCall::WriteFile(spec.path.clone()))?;
        self.with_state(|s| {
            s.files.insert(
                spec.path.clone(),
                FileFact {
                    content: content.to_vec(),
                    mode: spec.mode.as_deref().map(normalize_mode),
                    owner: spec.owner.clone(),
                    group: spec.group.clone(),
                },
            );
        });
        Ok(())
    }

    fn backup_file(&self, path: &str) -> Result<(), ExecError> {
        self.record(HostCall::Backup(path.to_string()))?;
        self.with_state(|s| {
            if let Some(existing) = s.files.get(path).cloned() {
                s.files.insert(format!("{}.bak", path), existing);
            }
        });
        Ok(())
    }

    fn create_directory(&self, spec: &FileSpec) -> Result<(), ExecError> {
        self.record(HostCall::CreateDir(spec.path.clone()))?;
        self.with_state(|s| {
            s.directories.insert(
                spec.path.clone(),
                DirectoryFact {
                    mode: spec.mode.as_deref().map(normalize_mode),
                    owner: spec.owner.clone(),
                    group: spec.group.clone(),
                },
            );
        });
        Ok(())
    }

    fn install_packages(&self, packages: &[String], _update: bool) -> Result<(), ExecError> {
        self.record(HostCall::Install(packages.to_vec()))?;
        self.with_state(|s| {
            for package in packages {
                s.packages.insert(package.clone(), "1.0".to_string());
            }
        });
        Ok(())
    }

    fn set_service(&self, unit: &str, target: ServiceTarget) -> Result<(), ExecError> {
        self.record(HostCall::SetService {
            unit: unit.to_string(),
            target,
        })?;
        self.with_state(|s| {
            let svc = s.services.entry(unit.to_string()).or_default();
            svc.loaded = true;
            if let Some(enabled) = target.enabled {
                svc.enabled = enabled;
            }
            if let Some(running) = target.running {
                svc.active = running;
            }
        });
        Ok(())
    }

    fn restart_service(&self, unit: &str) -> Result<(), ExecError> {
        self.record(HostCall::Restart(unit.to_string()))?;
        self.with_state(|s| {
            let svc = s.services.entry(unit.to_string()).or_default();
            svc.loaded = true;
            svc.active = true;
        });
        Ok(())
    }

    fn daemon_reload(&self) -> Result<(), ExecError> {
        self.record(HostCall::DaemonReload)
    }

    fn set_sysctl(&self, key: &str, value: &str, _persist: bool) -> Result<(), ExecError> {
        self.record(HostCall::Sysctl {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        self.with_state(|s| s.sysctl.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    fn load_kernel_module(&self, name: &str) -> Result<(), ExecError> {
        self.record(HostCall::LoadModule(name.to_string()))?;
        self.with_state(|s| s.modules.insert(name.to_string()));
        Ok(())
    }

    fn mount(&self, target: &str) -> Result<(), ExecError> {
        self.record(HostCall::Mount(target.to_string()))?;
        self.with_state(|s| {
            let fstab = s.files.get("/etc/fstab").map(FileFact::text).unwrap_or_default();
            let entry = fstab.lines().find_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                (fields.len() >= 3 && fields[1] == target).then(|| MountFact {
                    source: fields[0].to_string(),
                    target: fields[1].to_string(),
                    fstype: fields[2].to_string(),
                })
            });
            match entry {
                Some(m) => {
                    s.mounts.retain(|existing| existing.target != target);
                    s.mounts.push(m);
                    Ok(())
                }
                None => Err(ExecError::CommandFailed {
                    command: format!("mount {}", target),
                    code: Some(1),
                    stderr: format!("can't find {} in /etc/fstab", target),
                }),
            }
        })
    }

    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.record(HostCall::Run(command.script.clone()))?;
        {
            let effects = lock(&self.effects);
            let mut state = lock(&self.state);
            for (pattern, effect) in effects.iter() {
                if command.script.contains(pattern.as_str()) {
                    effect(&mut state);
                }
            }
        }
        match self.response(&command.script) {
            Some(output) if !output.success() => Err(ExecError::CommandFailed {
                command: command.script.clone(),
                code: output.code,
                stderr: output.stderr_str(),
            }),
            Some(output) => Ok(output),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

impl Host for FakeHost {
    fn name(&self) -> &str {
        &self.name
    }
}
