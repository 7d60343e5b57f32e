//! Core types for declarative host convergence

use serde::{Deserialize, Serialize};
use std::process::Output;

/// Observed state of an operation's target compared to its desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeState {
    /// Target exists and already matches
    Matches,
    /// Target exists but differs from desired
    Differs { current: String, desired: String },
    /// Target does not exist
    Absent,
}

impl ProbeState {
    /// Check if no change is needed
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matches)
    }

    /// Shorthand for a `Differs` state
    pub fn differs(current: impl Into<String>, desired: impl Into<String>) -> Self {
        Self::Differs {
            current: current.into(),
            desired: desired.into(),
        }
    }

    /// `Matches` when the condition holds, `Absent` otherwise
    pub fn present_if(condition: bool) -> Self {
        if condition { Self::Matches } else { Self::Absent }
    }
}

/// Result of applying an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// Target already matched; nothing was done
    Unchanged,
    /// Remote state was altered
    Changed,
    /// Apply failed
    Failed { reason: String },
    /// Apply was skipped (dry run)
    Skipped { reason: String },
}

impl ApplyResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Check if the result is a Change Flag
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub handlers: usize,
}

impl ExecuteSummary {
    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of operations processed
    pub fn total(&self) -> usize {
        self.changed + self.unchanged + self.skipped + self.failed
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ExecuteSummary) {
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.handlers += other.handlers;
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &ApplyResult) {
        match result {
            ApplyResult::Unchanged => self.unchanged += 1,
            ApplyResult::Changed => self.changed += 1,
            ApplyResult::Failed { .. } => self.failed += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Options for execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Verbose output
    pub verbose: bool,
}

/// Output from a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub code: Option<i32>,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            code: output.status.code(),
        }
    }
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            code: Some(0),
        }
    }

    /// Failed output with the given exit code
    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            code: Some(code),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_results() {
        let mut summary = ExecuteSummary::default();
        summary.add_result(&ApplyResult::Changed);
        summary.add_result(&ApplyResult::Unchanged);
        summary.add_result(&ApplyResult::Unchanged);
        summary.add_result(&ApplyResult::Failed {
            reason: "boom".into(),
        });

        assert_eq!(summary.total(), 4);
        assert_eq!(summary.changed, 1);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_present_if() {
        assert_eq!(ProbeState::present_if(true), ProbeState::Matches);
        assert_eq!(ProbeState::present_if(false), ProbeState::Absent);
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(1, "nope").success());
        assert!(!CommandOutput::default().success());
    }
}
