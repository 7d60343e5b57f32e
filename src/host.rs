//! Shell host - facts and changes over a [`Transport`]
//!
//! Every query and mutation is a small POSIX `sh` script. Probes use exit
//! status 77 to say "the target does not exist", so a missing file is never
//! confused with a probe that could not run.

use declarative::{
    CommandOutput, CommandSpec, DirectoryFact, ExecError, FactProbe, FileFact, FileSpec, Host,
    HostExecutor, MountFact, ProbeError, ServiceFact, ServiceTarget,
};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Settings;
use crate::inventory::{Connection, HostConfig};
use crate::resource::quote;
use crate::runner::{LocalTransport, SshTransport, Transport};
use crate::sudo::Privilege;

/// Exit status probes use for "target does not exist"
const ABSENT: i32 = 77;

/// File that persists sysctl values written by hostwright
const SYSCTL_CONF: &str = "/etc/sysctl.d/99-hostwright.conf";

/// Facts gathered once per host before building plans
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    pub hostname: String,
    /// Home directory of the connecting user
    pub home: String,
    /// `uname -m`
    pub arch: String,
}

/// A managed host reached through a shell
pub struct ShellHost {
    name: String,
    transport: Box<dyn Transport>,
    privilege: Privilege,
}

impl ShellHost {
    pub fn new(name: &str, transport: Box<dyn Transport>, privilege: Privilege) -> Self {
        Self {
            name: name.to_string(),
            transport,
            privilege,
        }
    }

    /// Build the host from its inventory entry
    pub fn connect(host: &HostConfig, settings: &Settings) -> Self {
        let transport: Box<dyn Transport> = match host.connection {
            Connection::Local => Box::new(LocalTransport),
            Connection::Ssh => Box::new(SshTransport {
                address: host.address.clone(),
                user: host.ssh_user.clone(),
                port: host.ssh_port,
                options: settings.ssh.options.clone(),
                connect_timeout: settings.ssh.connect_timeout,
            }),
        };
        log::debug!("{} via {}", host.name, transport.describe());
        Self::new(&host.name, transport, Privilege::new(host.sudo))
    }

    /// Hostname, home directory and architecture
    pub fn gather_facts(&self) -> Result<HostFacts, ProbeError> {
        let out = self.query(
            "facts",
            &CommandSpec::user("hostname; printf '%s\\n' \"$HOME\"; uname -m"),
        )?;
        if !out.success() {
            return Err(ProbeError::new("facts", out.stderr_str().trim()));
        }
        parse_host_facts(&out.stdout_str()).ok_or_else(|| {
            ProbeError::new("facts", format!("unexpected output: {}", out.stdout_str()))
        })
    }

    fn exec(&self, command: &CommandSpec, stdin: Option<&[u8]>) -> Result<CommandOutput, ExecError> {
        let script = self.privilege.wrap(command);
        log::trace!("{}: {}", self.name, script);
        self.transport.exec(&script, stdin, command.timeout)
    }

    /// Run a read-only query; only transport failures are errors
    fn query(&self, target: &str, command: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        self.exec(command, None)
            .map_err(|e| ProbeError::new(target, e.to_string()))
    }

    /// Run a query whose non-zero exit (other than absent) is an error
    fn query_ok(
        &self,
        target: &str,
        command: &CommandSpec,
    ) -> Result<Option<CommandOutput>, ProbeError> {
        let out = self.query(target, command)?;
        match out.code {
            Some(0) => Ok(Some(out)),
            Some(ABSENT) => Ok(None),
            _ => Err(ProbeError::new(target, failure_message(&out))),
        }
    }

    /// Run a mutation; a non-zero exit is an error
    fn mutate(&self, command: &CommandSpec, stdin: Option<&[u8]>) -> Result<CommandOutput, ExecError> {
        let out = self.exec(command, stdin)?;
        if !out.success() {
            return Err(ExecError::CommandFailed {
                command: command.script.clone(),
                code: out.code,
                stderr: failure_message(&out),
            });
        }
        Ok(out)
    }
}

fn failure_message(out: &CommandOutput) -> String {
    let stderr = out.stderr_str();
    if stderr.trim().is_empty() {
        format!("exit status {:?}", out.code)
    } else {
        stderr.trim().to_string()
    }
}

// ============================================================================
// Output parsing
// ============================================================================

/// `hostname`, `$HOME`, `uname -m`, one per line
pub fn parse_host_facts(output: &str) -> Option<HostFacts> {
    let mut lines = output.lines().map(str::trim);
    let hostname = lines.next().filter(|l| !l.is_empty())?;
    let home = lines.next().filter(|l| !l.is_empty())?;
    let arch = lines.next().filter(|l| !l.is_empty())?;
    Some(HostFacts {
        hostname: hostname.to_string(),
        home: home.to_string(),
        arch: arch.to_string(),
    })
}

/// `stat -c '%a:%U:%G'` output
fn parse_attributes(line: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut parts = line.trim().splitn(3, ':').map(|p| p.to_string());
    (parts.next(), parts.next(), parts.next())
}

/// Attribute header line followed by the raw file content
pub fn parse_file_fact(stdout: &[u8]) -> Option<FileFact> {
    let split = stdout.iter().position(|b| *b == b'\n')?;
    let header = String::from_utf8_lossy(&stdout[..split]);
    let (mode, owner, group) = parse_attributes(&header);
    Some(FileFact {
        content: stdout[split + 1..].to_vec(),
        mode,
        owner,
        group,
    })
}

/// `dpkg-query -f '${Status} ${Version}'` output
pub fn parse_package_status(output: &str) -> Option<String> {
    let rest = output.trim().strip_prefix("install ok installed")?;
    Some(rest.trim().to_string())
}

/// `systemctl show -p LoadState -p UnitFileState -p ActiveState` output
pub fn parse_service_show(output: &str) -> ServiceFact {
    let props: BTreeMap<&str, &str> = output
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();
    ServiceFact {
        loaded: props.get("LoadState") == Some(&"loaded"),
        enabled: matches!(
            props.get("UnitFileState").copied(),
            Some("enabled" | "enabled-runtime" | "alias")
        ),
        active: matches!(
            props.get("ActiveState").copied(),
            Some("active" | "reloading" | "activating")
        ),
    }
}

/// `zfs get -H -o property,value all` output
pub fn parse_zfs_properties(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `findmnt -rn --nofsroot -o SOURCE,TARGET,FSTYPE` output
pub fn parse_findmnt(output: &str) -> Vec<MountFact> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().map(unescape_findmnt);
            Some(MountFact {
                source: fields.next()?,
                target: fields.next()?,
                fstype: fields.next()?,
            })
        })
        .collect()
}

/// findmnt raw output escapes blanks as `\x20`
fn unescape_findmnt(field: &str) -> String {
    field.replace("\\x20", " ").replace("\\x09", "\t")
}

// ============================================================================
// FactProbe
// ============================================================================

impl FactProbe for ShellHost {
    fn file(&self, path: &str) -> Result<Option<FileFact>, ProbeError> {
        let p = quote(path);
        let script = format!(
            "if [ -f {p} ]; then stat -c '%a:%U:%G' {p} && cat {p}; else exit {ABSENT}; fi"
        );
        let Some(out) = self.query_ok(path, &CommandSpec::root(script))? else {
            return Ok(None);
        };
        parse_file_fact(&out.stdout)
            .map(Some)
            .ok_or_else(|| ProbeError::new(path, "missing attribute header"))
    }

    fn directory(&self, path: &str) -> Result<Option<DirectoryFact>, ProbeError> {
        let p = quote(path);
        let script = format!("if [ -d {p} ]; then stat -c '%a:%U:%G' {p}; else exit {ABSENT}; fi");
        Ok(self
            .query_ok(path, &CommandSpec::root(script))?
            .map(|out| {
                let (mode, owner, group) = parse_attributes(&out.stdout_str());
                DirectoryFact { mode, owner, group }
            }))
    }

    fn package(&self, name: &str) -> Result<Option<String>, ProbeError> {
        let script = format!(
            "dpkg-query -W -f='${{Status}} ${{Version}}' {} 2>/dev/null || exit {ABSENT}",
            quote(name)
        );
        Ok(self
            .query_ok(name, &CommandSpec::user(script))?
            .and_then(|out| parse_package_status(&out.stdout_str())))
    }

    fn service(&self, unit: &str) -> Result<ServiceFact, ProbeError> {
        let script = format!(
            "systemctl show -p LoadState -p UnitFileState -p ActiveState {}",
            quote(unit)
        );
        let out = self
            .query_ok(unit, &CommandSpec::user(script))?
            .unwrap_or_default();
        Ok(parse_service_show(&out.stdout_str()))
    }

    fn sysctl(&self, key: &str) -> Result<Option<String>, ProbeError> {
        let script = format!("sysctl -n {} 2>/dev/null || exit {ABSENT}", quote(key));
        Ok(self
            .query_ok(key, &CommandSpec::user(script))?
            .map(|out| out.stdout_str().trim().to_string()))
    }

    fn kernel_module(&self, name: &str) -> Result<bool, ProbeError> {
        let script = format!("test -d /sys/module/{}", quote(&name.replace('-', "_")));
        Ok(self.query(name, &CommandSpec::user(script))?.success())
    }

    fn zfs_pools(&self) -> Result<Vec<String>, ProbeError> {
        let script = "command -v zpool >/dev/null 2>&1 || exit 0; zpool list -H -o name";
        let out = self
            .query_ok("zpool", &CommandSpec::root(script))?
            .unwrap_or_default();
        Ok(out
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn zfs_dataset(&self, name: &str) -> Result<Option<BTreeMap<String, String>>, ProbeError> {
        let script = format!(
            "zfs get -H -o property,value all {} 2>/dev/null || exit {ABSENT}",
            quote(name)
        );
        Ok(self
            .query_ok(name, &CommandSpec::root(script))?
            .map(|out| parse_zfs_properties(&out.stdout_str())))
    }

    fn mounts(&self) -> Result<Vec<MountFact>, ProbeError> {
        let out = self
            .query_ok(
                "mounts",
                &CommandSpec::user("findmnt -rn --nofsroot --canonicalize -o SOURCE,TARGET,FSTYPE"),
            )?
            .unwrap_or_default();
        Ok(parse_findmnt(&out.stdout_str()))
    }

    fn block_device(&self, path: &str) -> Result<bool, ProbeError> {
        let script = format!("test -b {}", quote(path));
        Ok(self.query(path, &CommandSpec::user(script))?.success())
    }

    fn check(&self, command: &CommandSpec) -> Result<bool, ProbeError> {
        Ok(self.query(&command.script, command)?.success())
    }

    fn output(&self, command: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        self.query(&command.script, command)
    }
}

// ============================================================================
// HostExecutor
// ============================================================================

fn attribute_commands(spec: &FileSpec, path: &str) -> Vec<String> {
    let mut commands = Vec::new();
    if let Some(mode) = &spec.mode {
        commands.push(format!("chmod {} {}", quote(mode), path));
    }
    match (&spec.owner, &spec.group) {
        (Some(owner), Some(group)) => {
            commands.push(format!("chown {} {}", quote(&format!("{}:{}", owner, group)), path))
        }
        (Some(owner), None) => commands.push(format!("chown {} {}", quote(owner), path)),
        (None, Some(group)) => commands.push(format!("chgrp {} {}", quote(group), path)),
        (None, None) => {}
    }
    commands
}

fn as_spec(sudo: bool, script: String) -> CommandSpec {
    if sudo {
        CommandSpec::root(script)
    } else {
        CommandSpec::user(script)
    }
}

/// Script that writes stdin to `spec.path` through a temporary file
pub fn write_file_script(spec: &FileSpec) -> String {
    let path = quote(&spec.path);
    let tmp = quote(&format!("{}.hostwright-tmp", spec.path));
    let mut steps = vec![
        format!("mkdir -p \"$(dirname {})\"", path),
        format!("cat > {}", tmp),
    ];
    steps.extend(attribute_commands(spec, &tmp));
    steps.push(format!("mv {} {}", tmp, path));
    steps.join(" && ")
}

/// Script that sets a sysctl live and optionally persists it
pub fn sysctl_script(key: &str, value: &str, persist: bool) -> String {
    let mut script = format!("sysctl -w {}", quote(&format!("{}={}", key, value)));
    if persist {
        let pattern = quote(&format!("^{} *=", key.replace('.', "\\.")));
        let line = quote(&format!("{} = {}", key, value));
        script.push_str(&format!(
            " && {{ grep -v {pattern} {conf} 2>/dev/null; echo {line}; }} > {conf}.tmp && mv {conf}.tmp {conf}",
            pattern = pattern,
            conf = SYSCTL_CONF,
            line = line
        ));
    }
    script
}

/// Script converging a unit's enablement and activity
pub fn service_script(unit: &str, target: ServiceTarget) -> Option<String> {
    let unit = quote(unit);
    let mut steps = Vec::new();
    match target.enabled {
        Some(true) => steps.push(format!("systemctl enable {}", unit)),
        Some(false) => steps.push(format!("systemctl disable {}", unit)),
        None => {}
    }
    match target.running {
        Some(true) => steps.push(format!("systemctl start {}", unit)),
        Some(false) => steps.push(format!("systemctl stop {}", unit)),
        None => {}
    }
    (!steps.is_empty()).then(|| steps.join(" && "))
}

impl HostExecutor for ShellHost {
    fn write_file(&self, spec: &FileSpec, content: &[u8]) -> Result<(), ExecError> {
        self.mutate(&as_spec(spec.sudo, write_file_script(spec)), Some(content))?;
        Ok(())
    }

    fn backup_file(&self, path: &str) -> Result<(), ExecError> {
        let p = quote(path);
        let bak = quote(&format!("{}.bak", path));
        self.mutate(
            &CommandSpec::root(format!("if [ -f {p} ]; then cp -p {p} {bak}; fi")),
            None,
        )?;
        Ok(())
    }

    fn create_directory(&self, spec: &FileSpec) -> Result<(), ExecError> {
        let path = quote(&spec.path);
        let mut steps = vec![format!("mkdir -p {}", path)];
        steps.extend(attribute_commands(spec, &path));
        self.mutate(&as_spec(spec.sudo, steps.join(" && ")), None)?;
        Ok(())
    }

    fn install_packages(&self, packages: &[String], update: bool) -> Result<(), ExecError> {
        if packages.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = packages.iter().map(|p| quote(p)).collect();
        let mut script = String::new();
        if update {
            script.push_str("apt-get update -q && ");
        }
        script.push_str(&format!("apt-get install -y -q {}", names.join(" ")));
        self.mutate(
            &CommandSpec::root(script).env("DEBIAN_FRONTEND", "noninteractive"),
            None,
        )?;
        Ok(())
    }

    fn set_service(&self, unit: &str, target: ServiceTarget) -> Result<(), ExecError> {
        if let Some(script) = service_script(unit, target) {
            self.mutate(&CommandSpec::root(script), None)?;
        }
        Ok(())
    }

    fn restart_service(&self, unit: &str) -> Result<(), ExecError> {
        self.mutate(
            &CommandSpec::root(format!("systemctl restart {}", quote(unit))),
            None,
        )?;
        Ok(())
    }

    fn daemon_reload(&self) -> Result<(), ExecError> {
        self.mutate(&CommandSpec::root("systemctl daemon-reload"), None)?;
        Ok(())
    }

    fn set_sysctl(&self, key: &str, value: &str, persist: bool) -> Result<(), ExecError> {
        self.mutate(&CommandSpec::root(sysctl_script(key, value, persist)), None)?;
        Ok(())
    }

    fn load_kernel_module(&self, name: &str) -> Result<(), ExecError> {
        let n = quote(name);
        self.mutate(
            &CommandSpec::root(format!(
                "modprobe {n} && echo {n} > /etc/modules-load.d/{n}.conf"
            )),
            None,
        )?;
        Ok(())
    }

    fn mount(&self, target: &str) -> Result<(), ExecError> {
        let t = quote(target);
        self.mutate(&CommandSpec::root(format!("mkdir -p {t} && mount {t}")), None)?;
        Ok(())
    }

    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.mutate(command, None)
    }
}

impl Host for ShellHost {
    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn local() -> ShellHost {
        ShellHost::new("local", Box::new(LocalTransport), Privilege::new(false))
    }

    #[test]
    fn test_parse_host_facts() {
        let facts = parse_host_facts("apollo\n/home/admin\naarch64\n").unwrap();
        assert_eq!(facts.hostname, "apollo");
        assert_eq!(facts.home, "/home/admin");
        assert_eq!(facts.arch, "aarch64");
        assert!(parse_host_facts("apollo\n").is_none());
    }

    #[test]
    fn test_parse_file_fact() {
        let fact = parse_file_fact(b"644:root:root\nline 1\nline 2\n").unwrap();
        assert_eq!(fact.mode.as_deref(), Some("644"));
        assert_eq!(fact.owner.as_deref(), Some("root"));
        assert_eq!(fact.text(), "line 1\nline 2\n");

        let empty = parse_file_fact(b"600:admin:admin\n").unwrap();
        assert!(empty.content.is_empty());
        assert!(parse_file_fact(b"").is_none());
    }

    #[test]
    fn test_parse_package_status() {
        assert_eq!(
            parse_package_status("install ok installed 2.6.4-3"),
            Some("2.6.4-3".to_string())
        );
        assert_eq!(parse_package_status("deinstall ok config-files 1.0"), None);
    }

    #[test]
    fn test_parse_service_show() {
        let svc = parse_service_show("LoadState=loaded\nUnitFileState=enabled\nActiveState=active\n");
        assert!(svc.loaded && svc.enabled && svc.active);

        let svc = parse_service_show("LoadState=not-found\nUnitFileState=\nActiveState=inactive\n");
        assert!(!svc.loaded && !svc.enabled && !svc.active);

        let svc = parse_service_show("LoadState=loaded\nUnitFileState=disabled\nActiveState=failed\n");
        assert!(svc.loaded && !svc.enabled && !svc.active);
    }

    #[test]
    fn test_parse_zfs_and_findmnt() {
        let props = parse_zfs_properties("compression\tlz4\nmountpoint\t/export/media\n");
        assert_eq!(props["compression"], "lz4");

        let mounts = parse_findmnt("/dev/sda2 / ext4\n/dev/sdb1 /mnt/my\\x20disk xfs\n");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].target, "/mnt/my disk");
    }

    #[test]
    fn test_sysctl_script() {
        assert_eq!(sysctl_script("fs.file-max", "65536", false), "sysctl -w fs.file-max=65536");
        let script = sysctl_script("net.ipv4.ip_forward", "1", true);
        assert!(script.contains("grep -v '^net\\.ipv4\\.ip_forward *='"));
        assert!(script.contains("echo 'net.ipv4.ip_forward = 1'"));
    }

    #[test]
    fn test_service_script() {
        let script = service_script(
            "multipathd.socket",
            ServiceTarget {
                enabled: Some(false),
                running: Some(false),
            },
        );
        assert_eq!(
            script.as_deref(),
            Some("systemctl disable multipathd.socket && systemctl stop multipathd.socket")
        );
        assert!(service_script("x", ServiceTarget::default()).is_none());
    }

    #[test]
    fn test_local_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sub").join("exports");
        let path_str = path.to_string_lossy().to_string();
        let host = local();

        assert_eq!(host.file(&path_str).unwrap(), None);

        let spec = FileSpec::user(path_str.clone(), "0600");
        host.write_file(&spec, b"/export *(rw)\n").unwrap();

        let fact = host.file(&path_str).unwrap().unwrap();
        assert_eq!(fact.content, b"/export *(rw)\n");
        assert_eq!(fact.mode.as_deref(), Some("600"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "/export *(rw)\n");
    }

    #[test]
    fn test_local_directory_and_check() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a b");
        let dir_str = dir.to_string_lossy().to_string();
        let host = local();

        assert!(host.directory(&dir_str).unwrap().is_none());
        let spec = FileSpec::user(dir_str.clone(), "0750");
        host.create_directory(&spec).unwrap();
        assert_eq!(
            host.directory(&dir_str).unwrap().unwrap().mode.as_deref(),
            Some("750")
        );

        assert!(host.check(&CommandSpec::user("true")).unwrap());
        assert!(!host.check(&CommandSpec::user("false")).unwrap());
        assert!(host.run(&CommandSpec::user("exit 4")).is_err());
    }
}
