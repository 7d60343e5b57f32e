//! Mount resource - an fstab entry that is currently mounted

use anyhow::Result;
use declarative::{ApplyContext, ApplyResult, FactProbe, Operation, ProbeError, ProbeState};

/// Mount point that must be active; the entry itself lives in /etc/fstab
#[derive(Debug, Clone)]
pub struct Mounted {
    pub target: String,
}

impl Mounted {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.trim_end_matches('/').to_string(),
        }
    }
}

impl Operation for Mounted {
    fn id(&self) -> String {
        format!("mount:{}", self.target)
    }

    fn description(&self) -> String {
        format!("Mount {}", self.target)
    }

    fn kind(&self) -> &'static str {
        "mount"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let mounts = facts.mounts()?;
        Ok(ProbeState::present_if(
            mounts.iter().any(|m| m.target == self.target),
        ))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.mount(&self.target)?;
        Ok(ApplyResult::Changed)
    }
}
