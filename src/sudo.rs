//! Privilege escalation for remote scripts
//!
//! Every script runs as the connecting user. Operations that need root are
//! wrapped in a non-interactive `sudo -n sh -c`, so a host without
//! passwordless sudo fails loudly instead of hanging on a prompt. Hosts
//! reached as root set `sudo = false` in the inventory.

use crate::resource::quote;
use declarative::CommandSpec;

/// How privileged commands are wrapped on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privilege {
    /// Prefix privileged scripts with `sudo -n`
    pub use_sudo: bool,
}

impl Privilege {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Render a command as a single `sh` script
    ///
    /// Environment variables are exported inside the wrapped script so they
    /// survive `sudo`'s environment reset.
    pub fn wrap(&self, command: &CommandSpec) -> String {
        let mut script = String::new();
        for (key, value) in &command.env {
            script.push_str(&format!("export {}={}; ", key, quote(value)));
        }
        script.push_str(&command.script);

        if command.sudo && self.use_sudo {
            format!("sudo -n sh -c {}", quote(&script))
        } else {
            script
        }
    }
}
