//! Execution engine - converges one module plan on one host
//!
//! Operations run strictly in plan order. For each one the executor checks
//! its guard, probes the target and applies only when the target does not
//! match. The first failure stops the module; handlers run only when every
//! operation succeeded.

use crate::context::{ApplyContext, ProgressCallback};
use crate::error::Error;
use crate::facts::FactProbe;
use crate::host::{Host, HostExecutor};
use crate::planner::ModulePlan;
use crate::propagate::select_handlers;
use crate::types::{ApplyResult, ExecuteOptions, ExecuteSummary, ProbeState};
use serde::Serialize;
use std::collections::HashSet;

/// Outcome of a single operation
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub kind: String,
    pub description: String,
    /// What the probe saw, if it ran
    pub state: Option<ProbeState>,
    pub result: ApplyResult,
}

/// Outcome of a dependent action
#[derive(Debug, Clone, Serialize)]
pub struct HandlerReport {
    pub id: String,
    pub description: String,
    pub result: ApplyResult,
}

/// Outcome of one module on one host
#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub module: String,
    pub steps: Vec<StepReport>,
    pub handlers: Vec<HandlerReport>,
    /// The failure that stopped the module, if any
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ModuleReport {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            steps: Vec::new(),
            handlers: Vec::new(),
            error: None,
        }
    }

    /// A module that failed before any host call
    pub fn failed(module: &str, error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::new(module)
        }
    }

    /// Whether every operation and handler succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether any operation changed the host
    pub fn changed(&self) -> bool {
        self.steps.iter().any(|s| s.result.is_change())
    }

    /// Tally operation results
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for step in &self.steps {
            summary.add_result(&step.result);
        }
        if self.error.is_some() && summary.failed == 0 {
            summary.failed = 1;
        }
        summary.handlers = self
            .handlers
            .iter()
            .filter(|h| h.result.is_change())
            .count();
        summary
    }
}

/// Converge a module plan on a host
///
/// Never returns early with `Err`: every failure is recorded in the report
/// so the caller can render partial progress.
pub fn execute_plan(
    plan: &ModulePlan,
    host: &dyn Host,
    opts: &ExecuteOptions,
    progress: &mut dyn ProgressCallback,
) -> ModuleReport {
    let facts: &dyn FactProbe = host;
    let executor: &dyn HostExecutor = host;
    let mut report = ModuleReport::new(&plan.module);
    let mut changed: HashSet<String> = HashSet::new();

    progress.on_module_start(&plan.module, plan.operations.len());

    for op in &plan.operations {
        let id = op.id();
        let description = op.description();
        progress.on_operation_start(&id, &description);

        let (state, result, error) = run_operation(op.as_ref(), facts, executor, opts);
        log::debug!("{} [{}]: {:?}", plan.module, id, result);

        if result.is_change() || (opts.dry_run && state.as_ref().is_some_and(|s| !s.is_match()))
        {
            changed.insert(id.clone());
        }
        progress.on_operation_complete(&id, &result);
        report.steps.push(StepReport {
            id,
            kind: op.kind().to_string(),
            description,
            state,
            result,
        });

        if let Some(error) = error {
            log::warn!("{}: {}", plan.module, error);
            report.error = Some(error);
            progress.on_module_complete(&plan.module, false);
            return report;
        }
    }

    for handler in select_handlers(&plan.handlers, &changed) {
        let id = handler.action.id();
        let description = handler.action.description();
        progress.on_operation_start(&id, &description);

        let result = if opts.dry_run {
            ApplyResult::Skipped {
                reason: "dry run".to_string(),
            }
        } else {
            match handler.action.run(executor) {
                Ok(()) => ApplyResult::Changed,
                Err(e) => ApplyResult::Failed {
                    reason: e.to_string(),
                },
            }
        };

        progress.on_operation_complete(&id, &result);
        let failure = match &result {
            ApplyResult::Failed { reason } => Some(Error::Operation {
                operation: id.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        };
        report.handlers.push(HandlerReport {
            id,
            description,
            result,
        });

        if let Some(error) = failure {
            log::warn!("{}: {}", plan.module, error);
            report.error = Some(error);
            progress.on_module_complete(&plan.module, false);
            return report;
        }
    }

    progress.on_module_complete(&plan.module, true);
    report
}

/// Guard, probe and apply one operation
fn run_operation(
    op: &dyn crate::operation::Operation,
    facts: &dyn FactProbe,
    executor: &dyn HostExecutor,
    opts: &ExecuteOptions,
) -> (Option<ProbeState>, ApplyResult, Option<Error>) {
    if let Err(violation) = op.guard(facts) {
        let error = Error::ValidationGuard {
            operation: op.id(),
            reason: violation.reason.clone(),
        };
        let result = ApplyResult::Failed {
            reason: violation.reason,
        };
        return (None, result, Some(error));
    }

    let state = match op.probe(facts) {
        Ok(state) => state,
        Err(e) => {
            let result = ApplyResult::Failed {
                reason: e.to_string(),
            };
            let error = Error::Probe {
                operation: op.id(),
                source: e,
            };
            return (None, result, Some(error));
        }
    };

    if state.is_match() {
        return (Some(state), ApplyResult::Unchanged, None);
    }

    if opts.dry_run {
        let result = ApplyResult::Skipped {
            reason: "dry run".to_string(),
        };
        return (Some(state), result, None);
    }

    let mut ctx = ApplyContext::new(executor, facts, opts.verbose);
    match op.apply(&mut ctx) {
        Ok(ApplyResult::Failed { reason }) => {
            let error = Error::Operation {
                operation: op.id(),
                reason: reason.clone(),
            };
            (Some(state), ApplyResult::Failed { reason }, Some(error))
        }
        Ok(result) => (Some(state), result, None),
        Err(e) => {
            let reason = format!("{:#}", e);
            let error = Error::Operation {
                operation: op.id(),
                reason: reason.clone(),
            };
            (Some(state), ApplyResult::Failed { reason }, Some(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::error::{GuardViolation, ProbeError};
    use crate::host::{CommandSpec, FileSpec};
    use crate::operation::Operation;
    use crate::propagate::HandlerAction;
    use crate::testing::FakeHost;

    /// Writes a unit file when its content differs
    #[derive(Debug)]
    struct Unit {
        path: &'static str,
        content: &'static str,
    }

    impl Operation for Unit {
        fn id(&self) -> String {
            format!("file:{}", self.path)
        }
        fn description(&self) -> String {
            format!("Write {}", self.path)
        }
        fn kind(&self) -> &'static str {
            "file"
        }
        fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
            Ok(match facts.file(self.path)? {
                None => ProbeState::Absent,
                Some(f) if f.content == self.content.as_bytes() => ProbeState::Matches,
                Some(f) => ProbeState::differs(f.text(), self.content),
            })
        }
        fn apply(&self, ctx: &mut ApplyContext) -> anyhow::Result<ApplyResult> {
            ctx.host
                .write_file(&FileSpec::root(self.path, "0644"), self.content.as_bytes())?;
            Ok(ApplyResult::Changed)
        }
    }

    /// Keeps a unit enabled and running
    #[derive(Debug)]
    struct Running(&'static str);

    impl Operation for Running {
        fn id(&self) -> String {
            format!("service:{}", self.0)
        }
        fn description(&self) -> String {
            format!("Start {}", self.0)
        }
        fn kind(&self) -> &'static str {
            "service"
        }
        fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
            let svc = facts.service(self.0)?;
            Ok(ProbeState::present_if(svc.enabled && svc.active))
        }
        fn apply(&self, ctx: &mut ApplyContext) -> anyhow::Result<ApplyResult> {
            ctx.host.set_service(
                self.0,
                crate::host::ServiceTarget {
                    enabled: Some(true),
                    running: Some(true),
                },
            )?;
            Ok(ApplyResult::Changed)
        }
    }

    #[derive(Debug)]
    struct Refuse;

    impl Operation for Refuse {
        fn id(&self) -> String {
            "wipe:/dev/sda".into()
        }
        fn description(&self) -> String {
            "Wipe /dev/sda".into()
        }
        fn kind(&self) -> &'static str {
            "wipe"
        }
        fn guard(&self, _facts: &dyn FactProbe) -> Result<(), GuardViolation> {
            Err(GuardViolation::new("/dev/sda is protected"))
        }
        fn probe(&self, _facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
            Ok(ProbeState::Absent)
        }
        fn apply(&self, ctx: &mut ApplyContext) -> anyhow::Result<ApplyResult> {
            ctx.host.run(&CommandSpec::root("wipefs --all /dev/sda"))?;
            Ok(ApplyResult::Changed)
        }
        fn destructive(&self) -> bool {
            true
        }
    }

    fn service_plan() -> ModulePlan {
        let mut plan = ModulePlan::new("exporter");
        let unit = plan.add(Unit {
            path: "/etc/systemd/system/exporter.service",
            content: "[Service]\nExecStart=/usr/local/bin/exporter\n",
        });
        let svc = plan.add(Running("exporter.service"));
        plan.notify(HandlerAction::DaemonReload, &[unit.clone(), svc.clone()]);
        plan.notify(
            HandlerAction::Restart("exporter.service".into()),
            &[unit, svc],
        );
        plan
    }

    fn run(plan: &ModulePlan, host: &FakeHost) -> ModuleReport {
        execute_plan(plan, host, &ExecuteOptions::default(), &mut NoProgress)
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let host = FakeHost::new("node1");
        let plan = service_plan();

        let first = run(&plan, &host);
        assert!(first.is_success());
        assert!(first.changed());
        assert_eq!(first.handlers.len(), 2);
        assert_eq!(first.handlers[0].id, "handler:daemon-reload");

        let second = run(&plan, &host);
        assert!(second.is_success());
        assert!(!second.changed());
        assert!(second.handlers.is_empty());
        assert_eq!(host.daemon_reloads(), 1);
        assert_eq!(host.restarts("exporter.service"), 1);
    }

    #[test]
    fn test_stopped_service_triggers_handlers_once() {
        let host = FakeHost::new("node1");
        let plan = service_plan();
        run(&plan, &host);

        host.with_state(|s| {
            if let Some(svc) = s.services.get_mut("exporter.service") {
                svc.active = false;
                svc.enabled = false;
            }
        });

        let second = run(&plan, &host);
        assert_eq!(second.summary().changed, 1);
        assert_eq!(second.handlers.len(), 2);
        assert_eq!(host.daemon_reloads(), 2);
        assert_eq!(host.restarts("exporter.service"), 2);

        let third = run(&plan, &host);
        assert!(!third.changed());
        assert!(third.handlers.is_empty());
        assert_eq!(host.daemon_reloads(), 2);
        assert_eq!(host.restarts("exporter.service"), 2);
    }

    #[test]
    fn test_failure_stops_module_and_skips_handlers() {
        let host = FakeHost::new("node1");
        host.fail_on("service exporter.service");
        let mut plan = service_plan();
        plan.add(Unit {
            path: "/etc/never-written",
            content: "x",
        });

        let report = run(&plan, &host);
        assert!(!report.is_success());
        assert_eq!(report.steps.len(), 2);
        assert!(report.handlers.is_empty());
        assert!(host.file_text("/etc/never-written").is_none());
        assert_eq!(host.daemon_reloads(), 0);
        assert_eq!(report.error.as_ref().map(|e| e.category()), Some("operation"));
    }

    #[test]
    fn test_guard_blocks_before_any_call() {
        let host = FakeHost::new("node1");
        let mut plan = ModulePlan::new("wipe-disk");
        plan.add(Refuse);

        let report = run(&plan, &host);
        assert!(matches!(report.error, Some(Error::ValidationGuard { .. })));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_dry_run_leaves_host_untouched() {
        let host = FakeHost::new("node1");
        let plan = service_plan();
        let opts = ExecuteOptions {
            dry_run: true,
            verbose: false,
        };

        let report = execute_plan(&plan, &host, &opts, &mut NoProgress);
        assert!(report.is_success());
        assert!(
            report
                .steps
                .iter()
                .all(|s| matches!(s.result, ApplyResult::Skipped { .. }))
        );
        assert_eq!(report.handlers.len(), 2);
        assert!(host.calls().is_empty());
    }
}
