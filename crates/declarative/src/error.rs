//! Error types for convergence runs.
//!
//! The taxonomy separates configuration problems (caught before any host
//! call), probe failures (the host could not answer), operation failures
//! (a change was attempted and failed) and guard violations (a safety check
//! refused to let a destructive operation run).

use thiserror::Error;

/// A fact query could not be executed on the host.
///
/// This is distinct from a fact being absent: absence is a valid answer,
/// a `ProbeError` means there is no answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("probe of {target} failed: {message}")]
pub struct ProbeError {
    /// What was being probed (path, unit, package, ...)
    pub target: String,
    /// Transport or permission failure details
    pub message: String,
}

impl ProbeError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// A mutation on the host failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The transport itself failed (ssh not reachable, spawn failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// The command ran and exited non-zero
    #[error("command failed (exit {code:?}): {command}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// A safety check refused to let an operation run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct GuardViolation {
    pub reason: String,
}

impl GuardViolation {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors that stop a module run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A required inventory key is absent; nothing was sent to the host
    #[error("{module}: required key '{key}' is missing")]
    ConfigurationMissing { module: String, key: String },

    /// An inventory value is present but unusable
    #[error("{module}: {reason}")]
    InvalidConfiguration { module: String, reason: String },

    /// A remote fact could not be determined
    #[error("{operation}: {source}")]
    Probe {
        operation: String,
        #[source]
        source: ProbeError,
    },

    /// A remote command or write failed
    #[error("{operation}: {reason}")]
    Operation { operation: String, reason: String },

    /// A safety check blocked the operation before execution
    #[error("{operation}: blocked by safety check: {reason}")]
    ValidationGuard { operation: String, reason: String },
}

impl Error {
    /// Short category name for reports
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } | Self::InvalidConfiguration { .. } => {
                "configuration"
            }
            Self::Probe { .. } => "probe",
            Self::Operation { .. } => "operation",
            Self::ValidationGuard { .. } => "guard",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::ConfigurationMissing {
            module: "k3s".into(),
            key: "token".into(),
        };
        assert_eq!(err.to_string(), "k3s: required key 'token' is missing");
        assert_eq!(err.category(), "configuration");

        let err = Error::Probe {
            operation: "file:/etc/exports".into(),
            source: ProbeError::new("/etc/exports", "permission denied"),
        };
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_guard_violation_display() {
        let guard = GuardViolation::new("device is mounted on /boot");
        assert_eq!(guard.to_string(), "device is mounted on /boot");
    }
}
