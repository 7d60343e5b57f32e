//! Kernel resources - sysctl parameters and kernel modules

use anyhow::Result;
use declarative::{ApplyContext, ApplyResult, FactProbe, Operation, ProbeError, ProbeState};

/// A kernel parameter, set live and persisted across reboots
#[derive(Debug, Clone)]
pub struct Sysctl {
    pub key: String,
    pub value: String,
    pub persist: bool,
}

impl Sysctl {
    pub fn persistent(key: &str, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            persist: true,
        }
    }
}

/// sysctl prints multi-value keys tab separated
fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Operation for Sysctl {
    fn id(&self) -> String {
        format!("sysctl:{}", self.key)
    }

    fn description(&self) -> String {
        format!("Set {} = {}", self.key, self.value)
    }

    fn kind(&self) -> &'static str {
        "sysctl"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        Ok(match facts.sysctl(&self.key)? {
            None => ProbeState::Absent,
            Some(v) if normalize(&v) == normalize(&self.value) => ProbeState::Matches,
            Some(v) => ProbeState::differs(v, self.value.clone()),
        })
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.set_sysctl(&self.key, &self.value, self.persist)?;
        Ok(ApplyResult::Changed)
    }
}

/// A loaded kernel module
#[derive(Debug, Clone)]
pub struct KernelModule {
    pub name: String,
}

impl KernelModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Operation for KernelModule {
    fn id(&self) -> String {
        format!("modprobe:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Load kernel module {}", self.name)
    }

    fn kind(&self) -> &'static str {
        "kernel-module"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        Ok(ProbeState::present_if(facts.kernel_module(&self.name)?))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.load_kernel_module(&self.name)?;
        Ok(ApplyResult::Changed)
    }
}
