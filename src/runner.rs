//! Process runner - the only place that spawns processes for a host
//!
//! A [`Transport`] turns a shell script into a process: `ssh` for remote
//! hosts, `sh -c` for the local machine. Scripts arrive fully rendered
//! (privilege wrapping happens in [`crate::sudo`]).

use declarative::{CommandOutput, ExecError};
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::resource::quote;

/// Exit status ssh reserves for its own failures
const SSH_FAILURE: i32 = 255;

/// Runs a shell script somewhere
pub trait Transport: Send + Sync {
    /// Run `script` with `sh`, feeding `stdin` if given
    fn exec(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError>;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Runs scripts on the machine hostwright runs on
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn exec(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        run_process(command, "sh", stdin, timeout)
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

impl LocalTransport {
    /// Run a local script with extra environment variables
    ///
    /// Values travel in the process environment, not on the command line.
    pub fn exec_with_env(
        &self,
        script: &str,
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        for (key, value) in env {
            command.env(key, value);
        }
        run_process(command, "sh", stdin, None)
    }
}

/// Runs scripts over the system `ssh` binary
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Extra `-o` options from settings
    pub options: Vec<String>,
    pub connect_timeout: u64,
}

impl SshTransport {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }

    /// Arguments passed to `ssh` for a script
    pub fn args(&self, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ];
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination());
        args.push("--".to_string());
        // ssh joins remote arguments into one string for the login shell
        args.push(format!("sh -c {}", quote(script)));
        args
    }
}

impl Transport for SshTransport {
    fn exec(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new("ssh");
        command.args(self.args(script));
        let output = run_process(command, "ssh", stdin, timeout)?;

        if output.code == Some(SSH_FAILURE) {
            return Err(ExecError::Transport(format!(
                "ssh to {} failed: {}",
                self.destination(),
                output.stderr_str().trim()
            )));
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        match self.port {
            Some(port) => format!("ssh://{}:{}", self.destination(), port),
            None => format!("ssh://{}", self.destination()),
        }
    }
}

/// Spawn a process, feed stdin, collect output, enforce the timeout
fn run_process(
    mut command: Command,
    program: &str,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ExecError> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Transport(format!("failed to execute {}: {}", program, e)))?;

    let input = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            if let (Some(mut pipe), Some(data)) = (input, stdin) {
                match pipe.write_all(data) {
                    // The child exited without reading; its status says why
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
            Ok(())
        });
        let out_reader = scope.spawn(move || read_all(stdout));
        let err_reader = scope.spawn(move || read_all(stderr));

        let status = wait(&mut child, timeout, program)?;

        let write_result = writer.join().unwrap_or(Ok(()));
        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        if let Err(e) = write_result {
            return Err(ExecError::Transport(format!(
                "failed to send input to {}: {}",
                program, e
            )));
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            code: status.code(),
        })
    })
}

fn read_all(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn wait(child: &mut Child, timeout: Option<Duration>, program: &str) -> Result<ExitStatus, ExecError> {
    let transport = |e: std::io::Error| ExecError::Transport(format!("{}: {}", program, e));

    let Some(limit) = timeout else {
        return child.wait().map_err(transport);
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(transport)? {
            return Ok(status);
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecError::Transport(format!(
                "{} timed out after {}s",
                program,
                limit.as_secs()
            )));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let t = SshTransport {
            address: "apollo.example.net".into(),
            user: Some("admin".into()),
            port: Some(2222),
            options: vec!["StrictHostKeyChecking=accept-new".into()],
            connect_timeout: 10,
        };
        let args = t.args("uname -m");
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-p",
                "2222",
                "admin@apollo.example.net",
                "--",
                "sh -c 'uname -m'",
            ]
        );
        assert_eq!(t.describe(), "ssh://admin@apollo.example.net:2222");
    }

    #[test]
    fn test_local_exec_captures_output() {
        let out = LocalTransport.exec("echo hi; echo err >&2; exit 3", None, None).unwrap();
        assert_eq!(out.stdout_str(), "hi\n");
        assert_eq!(out.stderr_str(), "err\n");
        assert_eq!(out.code, Some(3));
    }

    #[test]
    fn test_local_exec_feeds_stdin() {
        let out = LocalTransport.exec("cat", Some(b"payload"), None).unwrap();
        assert_eq!(out.stdout, b"payload");
    }

    #[test]
    fn test_local_exec_unread_stdin_keeps_status() {
        let payload = vec![b'x'; 1024 * 1024];
        let out = LocalTransport
            .exec("echo 'refused' >&2; exit 4", Some(&payload), None)
            .unwrap();
        assert_eq!(out.code, Some(4));
        assert_eq!(out.stderr_str(), "refused\n");
    }

    #[test]
    fn test_local_exec_timeout() {
        let err = LocalTransport
            .exec("sleep 5", None, Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
