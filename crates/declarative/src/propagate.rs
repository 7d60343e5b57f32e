//! Change propagation - dependent actions gated on Change Flags

use crate::host::{CommandSpec, HostExecutor};
use crate::error::ExecError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Action run after a module's operations when an upstream operation changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerAction {
    /// `systemctl daemon-reload`
    DaemonReload,
    /// Restart a systemd unit
    Restart(String),
    /// Run a command
    Run { name: String, command: CommandSpec },
}

impl HandlerAction {
    /// Stable identifier for reports
    pub fn id(&self) -> String {
        match self {
            Self::DaemonReload => "handler:daemon-reload".to_string(),
            Self::Restart(unit) => format!("handler:restart:{}", unit),
            Self::Run { name, .. } => format!("handler:run:{}", name),
        }
    }

    /// Human-readable description
    pub fn description(&self) -> String {
        match self {
            Self::DaemonReload => "Reload systemd daemon".to_string(),
            Self::Restart(unit) => format!("Restart {}", unit),
            Self::Run { name, .. } => name.clone(),
        }
    }

    /// Execute the action on the host
    pub fn run(&self, host: &dyn HostExecutor) -> Result<(), ExecError> {
        match self {
            Self::DaemonReload => host.daemon_reload(),
            Self::Restart(unit) => host.restart_service(unit),
            Self::Run { command, .. } => host.run(command).map(|_| ()),
        }
    }

    // daemon-reload has to see new unit files before anything restarts
    fn rank(&self) -> u8 {
        match self {
            Self::DaemonReload => 0,
            _ => 1,
        }
    }
}

/// A dependent action and the operations whose changes trigger it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub action: HandlerAction,
    /// Ids of upstream operations
    pub triggers: Vec<String>,
}

impl Handler {
    /// Whether any trigger is in the changed set
    pub fn is_triggered(&self, changed: &HashSet<String>) -> bool {
        self.triggers.iter().any(|t| changed.contains(t))
    }
}

/// Add a handler, merging triggers into an existing handler with the same action
pub fn merge_handler(handlers: &mut Vec<Handler>, action: HandlerAction, triggers: &[String]) {
    if let Some(existing) = handlers.iter_mut().find(|h| h.action == action) {
        for trigger in triggers {
            if !existing.triggers.contains(trigger) {
                existing.triggers.push(trigger.clone());
            }
        }
        return;
    }

    handlers.push(Handler {
        action,
        triggers: triggers.to_vec(),
    });
}

/// Select the handlers to fire, in execution order
///
/// A handler fires iff at least one of its triggers changed. Each action
/// appears at most once. Daemon reloads come first; everything else keeps
/// declaration order.
pub fn select_handlers<'a>(handlers: &'a [Handler], changed: &HashSet<String>) -> Vec<&'a Handler> {
    let mut selected: Vec<&Handler> = Vec::new();
    for handler in handlers {
        if handler.is_triggered(changed) && !selected.iter().any(|h| h.action == handler.action) {
            selected.push(handler);
        }
    }
    // sort_by_key is stable
    selected.sort_by_key(|h| h.action.rank());
    selected
}
