//! Git resource - a repository cloned once

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, CommandSpec, FactProbe, Operation, ProbeError, ProbeState,
};

use super::quote;

/// A git checkout; existing checkouts are left alone (no pull)
#[derive(Debug, Clone)]
pub struct GitRepo {
    pub url: String,
    pub dest: String,
    pub branch: String,
}

impl GitRepo {
    pub fn new(url: &str, dest: impl Into<String>, branch: &str) -> Self {
        Self {
            url: url.to_string(),
            dest: dest.into(),
            branch: branch.to_string(),
        }
    }
}

impl Operation for GitRepo {
    fn id(&self) -> String {
        format!("git:{}", self.dest)
    }

    fn description(&self) -> String {
        format!("Clone {} into {}", self.url, self.dest)
    }

    fn kind(&self) -> &'static str {
        "git"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let git_dir = format!("{}/.git", self.dest);
        Ok(ProbeState::present_if(facts.directory(&git_dir)?.is_some()))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.run(&CommandSpec::user(format!(
            "git clone --branch {} {} {}",
            quote(&self.branch),
            quote(&self.url),
            quote(&self.dest)
        )))?;
        Ok(ApplyResult::Changed)
    }
}
