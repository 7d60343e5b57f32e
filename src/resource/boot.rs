//! Kernel command line parameters in boot configuration files

use anyhow::{Result, bail};
use declarative::{
    ApplyContext, ApplyResult, FactProbe, FileSpec, Operation, ProbeError, ProbeState,
};

/// Kernel parameters that must appear on a boot command line
///
/// With `variable` set the command line is the quoted value of a shell
/// assignment (`GRUB_CMDLINE_LINUX_DEFAULT="..."` in `/etc/default/grub`);
/// without it the first line of the file is the command line
/// (`/boot/firmware/cmdline.txt`). Missing parameters are appended; present
/// ones are left alone.
#[derive(Debug, Clone)]
pub struct KernelParams {
    pub spec: FileSpec,
    pub variable: Option<String>,
    pub params: Vec<String>,
    pub backup: bool,
}

impl KernelParams {
    /// Parameters inside a `VAR="..."` assignment
    pub fn assignment<S: AsRef<str>>(spec: FileSpec, variable: &str, params: &[S]) -> Self {
        Self {
            spec,
            variable: Some(variable.to_string()),
            params: params.iter().map(|p| p.as_ref().to_string()).collect(),
            backup: false,
        }
    }

    /// Parameters on the first line of a plain command line file
    pub fn first_line<S: AsRef<str>>(spec: FileSpec, params: &[S]) -> Self {
        Self {
            spec,
            variable: None,
            params: params.iter().map(|p| p.as_ref().to_string()).collect(),
            backup: false,
        }
    }

    pub fn with_backup(mut self) -> Self {
        self.backup = true;
        self
    }

    fn missing(&self, cmdline: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| !cmdline.split_whitespace().any(|t| t == p.as_str()))
            .map(String::as_str)
            .collect()
    }

    fn append(cmdline: &str, missing: &[&str]) -> String {
        let mut out = cmdline.trim_end().to_string();
        for param in missing {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(param);
        }
        out
    }

    /// Current command line, or `None` when the file has no place for one
    fn cmdline(&self, text: &str) -> Option<String> {
        match &self.variable {
            None => Some(text.lines().next().unwrap_or_default().to_string()),
            Some(var) => text.lines().find_map(|line| {
                line.strip_prefix(&format!("{}=", var))
                    .map(|v| v.trim().trim_matches('"').to_string())
            }),
        }
    }

    /// File content with every parameter present
    fn render(&self, text: &str) -> Option<String> {
        let cmdline = self.cmdline(text)?;
        let missing = self.missing(&cmdline);
        if missing.is_empty() {
            return Some(text.to_string());
        }
        let updated = Self::append(&cmdline, &missing);

        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        match &self.variable {
            None => {
                if lines.is_empty() {
                    lines.push(updated);
                } else {
                    lines[0] = updated;
                }
            }
            Some(var) => {
                let prefix = format!("{}=", var);
                if let Some(line) = lines.iter_mut().find(|l| l.starts_with(&prefix)) {
                    *line = format!("{}\"{}\"", prefix, updated);
                }
            }
        }
        let mut out = lines.join("\n");
        out.push('\n');
        Some(out)
    }
}

impl Operation for KernelParams {
    fn id(&self) -> String {
        format!("kernel-params:{}", self.spec.path)
    }

    fn description(&self) -> String {
        format!("Add {} to {}", self.params.join(" "), self.spec.path)
    }

    fn kind(&self) -> &'static str {
        "boot"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(file) = facts.file(&self.spec.path)? else {
            return Ok(ProbeState::Absent);
        };
        let Some(cmdline) = self.cmdline(&file.text()) else {
            return Ok(ProbeState::Absent);
        };
        let missing = self.missing(&cmdline);
        if missing.is_empty() {
            return Ok(ProbeState::Matches);
        }
        Ok(ProbeState::differs(
            cmdline.clone(),
            Self::append(&cmdline, &missing),
        ))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let Some(file) = ctx.facts.file(&self.spec.path)? else {
            bail!("{} does not exist", self.spec.path);
        };
        let text = file.text();
        let Some(rendered) = self.render(&text) else {
            bail!(
                "{} has no {} line",
                self.spec.path,
                self.variable.as_deref().unwrap_or("command")
            );
        };
        if rendered == text {
            return Ok(ApplyResult::Unchanged);
        }
        if self.backup {
            ctx.host.backup_file(&self.spec.path)?;
        }
        ctx.host.write_file(&self.spec, rendered.as_bytes())?;
        Ok(ApplyResult::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRUB: &str = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\nGRUB_CMDLINE_LINUX=\"\"\n";

    fn grub() -> KernelParams {
        KernelParams::assignment(
            FileSpec::root("/etc/default/grub", "0644"),
            "GRUB_CMDLINE_LINUX_DEFAULT",
            &["nvme_core.default_ps_max_latency_us=0", "pcie_aspm=off"],
        )
    }

    #[test]
    fn test_grub_render() {
        assert_eq!(
            grub().render(GRUB).unwrap(),
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash nvme_core.default_ps_max_latency_us=0 pcie_aspm=off\"\nGRUB_CMDLINE_LINUX=\"\"\n"
        );
    }

    #[test]
    fn test_grub_partial_and_empty() {
        let text = "GRUB_CMDLINE_LINUX_DEFAULT=\"pcie_aspm=off\"\n";
        assert_eq!(
            grub().render(text).unwrap(),
            "GRUB_CMDLINE_LINUX_DEFAULT=\"pcie_aspm=off nvme_core.default_ps_max_latency_us=0\"\n"
        );

        let text = "GRUB_CMDLINE_LINUX_DEFAULT=\"\"\n";
        assert_eq!(
            grub().render(text).unwrap(),
            "GRUB_CMDLINE_LINUX_DEFAULT=\"nvme_core.default_ps_max_latency_us=0 pcie_aspm=off\"\n"
        );

        assert!(grub().render("GRUB_DEFAULT=0\n").is_none());
    }

    #[test]
    fn test_cmdline_txt_repeated_names() {
        let op = KernelParams::first_line(
            FileSpec::plain("/boot/firmware/cmdline.txt"),
            &["cgroup_enable=cpuset", "cgroup_memory=1", "cgroup_enable=memory"],
        );
        let text = "console=tty1 root=PARTUUID=abc-02 rootwait cgroup_enable=cpuset\n";
        assert_eq!(
            op.render(text).unwrap(),
            "console=tty1 root=PARTUUID=abc-02 rootwait cgroup_enable=cpuset cgroup_memory=1 cgroup_enable=memory\n"
        );
        let done = op.render(text).unwrap();
        assert_eq!(op.render(&done).unwrap(), done);
    }
}
