//! Package resources - apt packages, apt sources, pip packages

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, CommandSpec, FactProbe, FileSpec, Operation, ProbeError,
    ProbeState,
};

use super::quote;

/// System packages installed through apt
#[derive(Debug, Clone)]
pub struct AptPackages {
    pub packages: Vec<String>,
    /// Refresh the package index before installing
    pub update: bool,
}

impl AptPackages {
    pub fn new<S: AsRef<str>>(packages: &[S]) -> Self {
        Self {
            packages: packages.iter().map(|p| p.as_ref().to_string()).collect(),
            update: false,
        }
    }

    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    fn missing(&self, facts: &dyn FactProbe) -> Result<Vec<String>, ProbeError> {
        let mut missing = Vec::new();
        for package in &self.packages {
            if facts.package(package)?.is_none() {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }
}

impl Operation for AptPackages {
    fn id(&self) -> String {
        format!("apt:{}", self.packages.join(","))
    }

    fn description(&self) -> String {
        format!("Install {}", self.packages.join(", "))
    }

    fn kind(&self) -> &'static str {
        "apt"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let missing = self.missing(facts)?;
        Ok(if missing.is_empty() {
            ProbeState::Matches
        } else if missing.len() == self.packages.len() {
            ProbeState::Absent
        } else {
            ProbeState::differs(
                format!("missing {}", missing.join(", ")),
                "all installed",
            )
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let missing = self.missing(ctx.facts)?;
        if missing.is_empty() {
            return Ok(ApplyResult::Unchanged);
        }
        ctx.host.install_packages(&missing, self.update)?;
        Ok(ApplyResult::Changed)
    }
}

/// An apt source list file; refreshes the index when written
#[derive(Debug, Clone)]
pub struct AptRepo {
    /// File name under /etc/apt/sources.list.d (without `.list`)
    pub name: String,
    pub line: String,
}

impl AptRepo {
    pub fn new(name: &str, line: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            line: line.into(),
        }
    }

    fn path(&self) -> String {
        format!("/etc/apt/sources.list.d/{}.list", self.name)
    }

    fn content(&self) -> String {
        format!("{}\n", self.line)
    }
}

impl Operation for AptRepo {
    fn id(&self) -> String {
        format!("apt-repo:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Add apt source {}", self.name)
    }

    fn kind(&self) -> &'static str {
        "apt-repo"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        Ok(match facts.file(&self.path())? {
            None => ProbeState::Absent,
            Some(f) if f.text() == self.content() => ProbeState::Matches,
            Some(f) => ProbeState::differs(f.text(), self.content()),
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.write_file(
            &FileSpec::root(self.path(), "0644"),
            self.content().as_bytes(),
        )?;
        ctx.host.run(&CommandSpec::root(
            "DEBIAN_FRONTEND=noninteractive apt-get update -q",
        ))?;
        Ok(ApplyResult::Changed)
    }
}

/// Python packages installed with a specific pip (usually inside a venv)
#[derive(Debug, Clone)]
pub struct PipPackages {
    /// Path to the pip executable
    pub pip: String,
    /// Requirements, optionally pinned with `==`
    pub packages: Vec<String>,
    /// Run as root
    pub sudo: bool,
}

impl PipPackages {
    pub fn new<S: AsRef<str>>(pip: impl Into<String>, packages: &[S]) -> Self {
        Self {
            pip: pip.into(),
            packages: packages.iter().map(|p| p.as_ref().to_string()).collect(),
            sudo: false,
        }
    }

    fn command(&self, script: String) -> CommandSpec {
        if self.sudo {
            CommandSpec::root(script)
        } else {
            CommandSpec::user(script)
        }
    }

    fn missing(&self, facts: &dyn FactProbe) -> Result<Vec<String>, ProbeError> {
        let mut missing = Vec::new();
        for requirement in &self.packages {
            let (name, version) = match requirement.split_once("==") {
                Some((n, v)) => (n, Some(v)),
                None => (requirement.as_str(), None),
            };
            let out = facts.output(&self.command(format!("{} show {}", self.pip, quote(name))))?;
            let installed = out.success()
                && version.is_none_or(|v| {
                    out.stdout_str()
                        .lines()
                        .any(|l| l.trim() == format!("Version: {}", v))
                });
            if !installed {
                missing.push(requirement.clone());
            }
        }
        Ok(missing)
    }
}

impl Operation for PipPackages {
    fn id(&self) -> String {
        format!("pip:{}:{}", self.pip, self.packages.join(","))
    }

    fn description(&self) -> String {
        format!("pip install {}", self.packages.join(" "))
    }

    fn kind(&self) -> &'static str {
        "pip"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let missing = self.missing(facts)?;
        Ok(if missing.is_empty() {
            ProbeState::Matches
        } else {
            ProbeState::differs(format!("missing {}", missing.join(", ")), "installed")
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let missing = self.missing(ctx.facts)?;
        if missing.is_empty() {
            return Ok(ApplyResult::Unchanged);
        }
        let args: Vec<String> = missing.iter().map(|p| quote(p)).collect();
        ctx.host.run(&self.command(format!(
            "{} install --upgrade {}",
            self.pip,
            args.join(" ")
        )))?;
        Ok(ApplyResult::Changed)
    }
}
