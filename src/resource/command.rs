//! Command resources - guarded shell commands and downloads

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, CommandSpec, FactProbe, Operation, ProbeError, ProbeState,
};

use super::quote;

/// When a command needs to run
#[derive(Debug, Clone)]
pub enum Condition {
    /// Run unless the check exits 0
    Unless(CommandSpec),
    /// Run only if the check exits 0
    OnlyIf(CommandSpec),
    /// Run unless the path exists (file or directory)
    Creates(String),
    /// Run unless the output of a command contains a string
    UnlessOutputContains { command: CommandSpec, needle: String },
}

/// A shell command made idempotent by a condition
#[derive(Debug, Clone)]
pub struct Command {
    /// Short label used in ids and reports
    pub name: String,
    pub command: CommandSpec,
    pub condition: Condition,
    pub destructive: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, command: CommandSpec, condition: Condition) -> Self {
        Self {
            name: name.into(),
            command,
            condition,
            destructive: false,
        }
    }

    /// Run as root unless `check` succeeds
    pub fn unless(name: impl Into<String>, script: impl Into<String>, check: &str) -> Self {
        Self::new(
            name,
            CommandSpec::root(script),
            Condition::Unless(CommandSpec::root(check)),
        )
    }

    /// Run as root unless `path` exists
    pub fn creates(name: impl Into<String>, script: impl Into<String>, path: &str) -> Self {
        Self::new(
            name,
            CommandSpec::root(script),
            Condition::Creates(path.to_string()),
        )
    }

    /// Mark as data-destroying
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

impl Operation for Command {
    fn id(&self) -> String {
        format!("command:{}", self.name)
    }

    fn description(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let satisfied = match &self.condition {
            Condition::Unless(check) => facts.check(check)?,
            Condition::OnlyIf(check) => !facts.check(check)?,
            Condition::Creates(path) => {
                facts.file(path)?.is_some() || facts.directory(path)?.is_some()
            }
            Condition::UnlessOutputContains { command, needle } => {
                let out = facts.output(command)?;
                out.success() && out.stdout_str().contains(needle.as_str())
            }
        };
        Ok(ProbeState::present_if(satisfied))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let out = ctx.host.run(&self.command)?;
        if ctx.verbose {
            log::info!("{}: {}", self.name, out.stdout_str().trim());
        }
        Ok(ApplyResult::Changed)
    }

    fn destructive(&self) -> bool {
        self.destructive
    }
}

/// A file downloaded once from a URL
#[derive(Debug, Clone)]
pub struct Download {
    pub url: String,
    pub dest: String,
    pub mode: String,
    pub sudo: bool,
}

impl Download {
    pub fn root(url: impl Into<String>, dest: impl Into<String>, mode: &str) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            mode: mode.to_string(),
            sudo: true,
        }
    }

    pub fn user(url: impl Into<String>, dest: impl Into<String>, mode: &str) -> Self {
        Self {
            sudo: false,
            ..Self::root(url, dest, mode)
        }
    }

    fn script(&self) -> String {
        let dest = quote(&self.dest);
        format!(
            "mkdir -p \"$(dirname {dest})\" && curl -fsSL -o {dest}.tmp {url} && mv {dest}.tmp {dest} && chmod {mode} {dest}",
            dest = dest,
            url = quote(&self.url),
            mode = self.mode
        )
    }
}

impl Operation for Download {
    fn id(&self) -> String {
        format!("download:{}", self.dest)
    }

    fn description(&self) -> String {
        format!("Download {} to {}", self.url, self.dest)
    }

    fn kind(&self) -> &'static str {
        "download"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        Ok(ProbeState::present_if(facts.file(&self.dest)?.is_some()))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let spec = if self.sudo {
            CommandSpec::root(self.script())
        } else {
            CommandSpec::user(self.script())
        };
        ctx.host.run(&spec)?;
        Ok(ApplyResult::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::CommandOutput;
    use declarative::testing::FakeHost;

    #[test]
    fn test_unless_output_contains() {
        let host = FakeHost::new("h");
        let op = Command::new(
            "Install k3s",
            CommandSpec::root("/usr/local/bin/k3s-install.sh"),
            Condition::UnlessOutputContains {
                command: CommandSpec::root("k3s --version"),
                needle: "v1.32.3+k3s1".into(),
            },
        );
        assert_eq!(op.probe(&host).unwrap(), ProbeState::Absent);

        host.respond("k3s --version", CommandOutput::ok("k3s version v1.32.3+k3s1 (abc)"));
        assert!(op.probe(&host).unwrap().is_match());
    }

    #[test]
    fn test_creates_checks_directories() {
        let host = FakeHost::new("h");
        let op = Command::creates("Create venv", "python3 -m venv /opt/v", "/opt/v");
        assert!(!op.probe(&host).unwrap().is_match());

        host.with_state(|s| s.directories.insert("/opt/v".into(), Default::default()));
        assert!(op.probe(&host).unwrap().is_match());
    }

    #[test]
    fn test_only_if() {
        let host = FakeHost::new("h");
        host.respond("ufw status", CommandOutput::ok("Status: active"));
        let op = Command::new(
            "Disable ufw",
            CommandSpec::root("ufw disable"),
            Condition::OnlyIf(CommandSpec::root("ufw status | grep -q 'Status: active'")),
        );
        assert_eq!(op.probe(&host).unwrap(), ProbeState::Absent);
    }

    #[test]
    fn test_download_script_quotes() {
        let op = Download::root(
            "https://example.net/a b.tar.gz",
            "/usr/local/bin/exporter",
            "0755",
        );
        let script = op.script();
        assert!(script.contains("'https://example.net/a b.tar.gz'"));
        assert!(script.ends_with("chmod 0755 /usr/local/bin/exporter"));
    }
}
