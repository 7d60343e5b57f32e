//! Module plans - ordered operations plus their dependent handlers

use crate::operation::{BoxedOperation, Operation};
use crate::propagate::{Handler, HandlerAction, merge_handler};
use std::collections::HashSet;

/// Ordered desired state for one module on one host
///
/// Operations run in insertion order. Handlers are the change propagation
/// rules: each fires at most once, after all operations, if any of its
/// trigger operations reported a change.
pub struct ModulePlan {
    /// Module name (e.g. "k3s")
    pub module: String,
    /// Operations in execution order
    pub operations: Vec<BoxedOperation>,
    /// Dependent actions
    pub handlers: Vec<Handler>,
    ids: HashSet<String>,
}

impl ModulePlan {
    /// Create a new empty plan
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            operations: Vec::new(),
            handlers: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Append an operation and return the id handlers should reference
    ///
    /// Operation ids are unique within a plan. When two operations share an
    /// id (the same command run twice), later ones get a `#n` suffix.
    pub fn add(&mut self, operation: impl Operation + 'static) -> String {
        self.add_boxed(Box::new(operation))
    }

    /// Append an already boxed operation
    pub fn add_boxed(&mut self, operation: BoxedOperation) -> String {
        let base = operation.id();
        let mut id = base.clone();
        let mut n = 2;
        while self.ids.contains(&id) {
            id = format!("{}#{}", base, n);
            n += 1;
        }
        self.ids.insert(id.clone());
        self.operations.push(Box::new(Renamed::wrap(operation, &id)));
        id
    }

    /// Register a dependent action triggered by changes in `triggers`
    pub fn notify(&mut self, action: HandlerAction, triggers: &[String]) {
        if triggers.is_empty() {
            return;
        }
        merge_handler(&mut self.handlers, action, triggers);
    }

    /// Keep only operations matching the predicate
    ///
    /// Handlers referencing removed operations keep their remaining triggers;
    /// handlers left without triggers are dropped.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&dyn Operation) -> bool,
    {
        let operations: Vec<BoxedOperation> = self
            .operations
            .into_iter()
            .filter(|op| predicate(op.as_ref()))
            .collect();
        let ids: HashSet<String> = operations.iter().map(|op| op.id()).collect();
        let handlers = self
            .handlers
            .into_iter()
            .filter_map(|mut h| {
                h.triggers.retain(|t| ids.contains(t));
                (!h.triggers.is_empty()).then_some(h)
            })
            .collect();

        Self {
            module: self.module,
            operations,
            handlers,
            ids,
        }
    }

    /// Keep only operations whose kind or id matches a target pattern
    ///
    /// Target format: "kind" or "kind:fragment" (e.g. "file", "service:k3s").
    pub fn filter_by_target(self, target: Option<&str>) -> Self {
        match target {
            None => self,
            Some(t) => {
                let (kind, fragment) = parse_target(t);
                self.filter(|op| matches_filter(op, kind.as_deref(), fragment.as_deref()))
            }
        }
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether any operation destroys data
    pub fn has_destructive(&self) -> bool {
        self.operations.iter().any(|op| op.destructive())
    }
}

impl std::fmt::Debug for ModulePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulePlan")
            .field("module", &self.module)
            .field("operations", &self.operations.len())
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Parse "kind:fragment" into (kind, fragment)
fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    match target.split_once(':') {
        None => (Some(target.to_string()), None),
        Some(("", fragment)) => (None, Some(fragment.to_string())),
        Some((kind, fragment)) => (Some(kind.to_string()), Some(fragment.to_string())),
    }
}

fn matches_filter(op: &dyn Operation, kind: Option<&str>, fragment: Option<&str>) -> bool {
    if let Some(k) = kind {
        let matches_kind = match k {
            "files" => op.kind() == "file" || op.kind() == "directory",
            "packages" => op.kind().starts_with("apt") || op.kind() == "pip",
            "services" => op.kind() == "service",
            _ => op.kind() == k,
        };
        if !matches_kind {
            return false;
        }
    }

    if let Some(f) = fragment
        && !op.id().contains(f)
    {
        return false;
    }

    true
}

/// Wrapper fixing the id of an operation after deduplication
#[derive(Debug)]
struct Renamed {
    inner: BoxedOperation,
    id: Option<String>,
}

impl Renamed {
    fn wrap(inner: BoxedOperation, id: &str) -> Self {
        let id = (inner.id() != id).then(|| id.to_string());
        Self { inner, id }
    }
}

impl Operation for Renamed {
    fn id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.inner.id())
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn guard(
        &self,
        facts: &dyn crate::facts::FactProbe,
    ) -> Result<(), crate::error::GuardViolation> {
        self.inner.guard(facts)
    }

    fn probe(
        &self,
        facts: &dyn crate::facts::FactProbe,
    ) -> Result<crate::types::ProbeState, crate::error::ProbeError> {
        self.inner.probe(facts)
    }

    fn apply(
        &self,
        ctx: &mut crate::context::ApplyContext,
    ) -> anyhow::Result<crate::types::ApplyResult> {
        self.inner.apply(ctx)
    }

    fn destructive(&self) -> bool {
        self.inner.destructive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ApplyContext;
    use crate::error::ProbeError;
    use crate::facts::FactProbe;
    use crate::types::{ApplyResult, ProbeState};

    #[derive(Debug)]
    struct Named(&'static str, &'static str);

    impl Operation for Named {
        fn id(&self) -> String {
            self.0.to_string()
        }
        fn description(&self) -> String {
            format!("named {}", self.0)
        }
        fn kind(&self) -> &'static str {
            self.1
        }
        fn probe(&self, _facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
            Ok(ProbeState::Matches)
        }
        fn apply(&self, _ctx: &mut ApplyContext) -> anyhow::Result<ApplyResult> {
            Ok(ApplyResult::Unchanged)
        }
    }

    #[test]
    fn test_add_deduplicates_ids() {
        let mut plan = ModulePlan::new("test");
        let a = plan.add(Named("command:exportfs -ra", "command"));
        let b = plan.add(Named("command:exportfs -ra", "command"));
        let c = plan.add(Named("command:exportfs -ra", "command"));

        assert_eq!(a, "command:exportfs -ra");
        assert_eq!(b, "command:exportfs -ra#2");
        assert_eq!(c, "command:exportfs -ra#3");
        assert_eq!(plan.operations[1].id(), b);
        assert_eq!(plan.operations[1].description(), "named command:exportfs -ra");
    }

    #[test]
    fn test_notify_ignores_empty_triggers() {
        let mut plan = ModulePlan::new("test");
        plan.notify(HandlerAction::DaemonReload, &[]);
        assert!(plan.handlers.is_empty());
    }

    #[test]
    fn test_filter_prunes_handler_triggers() {
        let mut plan = ModulePlan::new("test");
        let file = plan.add(Named("file:/etc/exports", "file"));
        let pkg = plan.add(Named("apt:nfs-kernel-server", "apt"));
        plan.notify(
            HandlerAction::Restart("nfs-server.service".into()),
            &[file.clone(), pkg.clone()],
        );
        plan.notify(HandlerAction::DaemonReload, std::slice::from_ref(&pkg));

        let plan = plan.filter_by_target(Some("files"));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.handlers.len(), 1);
        assert_eq!(plan.handlers[0].triggers, vec![file]);
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("file"), (Some("file".to_string()), None));
        assert_eq!(
            parse_target("service:k3s"),
            (Some("service".to_string()), Some("k3s".to_string()))
        );
        assert_eq!(parse_target(":k3s"), (None, Some("k3s".to_string())));
    }
}
