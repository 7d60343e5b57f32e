//! Diff computation for operations

use crate::error::ProbeError;
use crate::facts::FactProbe;
use crate::operation::Operation;
use crate::types::ProbeState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pending change: an operation whose target does not match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDiff {
    /// Operation id
    pub operation_id: String,
    /// Operation kind
    pub kind: String,
    /// Human-readable description
    pub description: String,
    /// Observed state
    pub state: ProbeState,
    /// Whether applying destroys data
    pub destructive: bool,
}

impl OperationDiff {
    /// Probe an operation, returning None if it already matches
    pub fn from_operation(
        op: &dyn Operation,
        facts: &dyn FactProbe,
    ) -> Result<Option<Self>, ProbeError> {
        let state = op.probe(facts)?;
        if state.is_match() {
            return Ok(None);
        }

        Ok(Some(Self {
            operation_id: op.id(),
            kind: op.kind().to_string(),
            description: op.description(),
            state,
            destructive: op.destructive(),
        }))
    }

    /// Check if the target does not exist yet
    pub fn is_addition(&self) -> bool {
        matches!(self.state, ProbeState::Absent)
    }

    /// Check if the target exists but differs
    pub fn is_modification(&self) -> bool {
        matches!(self.state, ProbeState::Differs { .. })
    }
}

/// Compute pending changes for a list of operations
///
/// Every operation is probed against the current host. Operations that
/// depend on an earlier one in the same plan (a unit file written before
/// its service is started) are reported against today's state, so the
/// result is an approximation of what `apply` will change.
pub fn compute_diffs(
    operations: &[Box<dyn Operation>],
    facts: &dyn FactProbe,
) -> Result<Vec<OperationDiff>, ProbeError> {
    let mut diffs = Vec::new();
    for op in operations {
        if let Some(diff) = OperationDiff::from_operation(op.as_ref(), facts)? {
            diffs.push(diff);
        }
    }
    Ok(diffs)
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffSummary {
    /// Targets to create
    pub additions: usize,
    /// Targets to modify
    pub modifications: usize,
    /// Destructive operations pending
    pub destructive: usize,
}

impl DiffSummary {
    /// Create a summary from a list of diffs
    pub fn from_diffs(diffs: &[OperationDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            if diff.is_addition() {
                summary.additions += 1;
            } else {
                summary.modifications += 1;
            }
            if diff.destructive {
                summary.destructive += 1;
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group diffs by operation kind
pub fn group_by_kind(diffs: &[OperationDiff]) -> BTreeMap<String, Vec<&OperationDiff>> {
    let mut groups: BTreeMap<String, Vec<&OperationDiff>> = BTreeMap::new();
    for diff in diffs {
        groups.entry(diff.kind.clone()).or_default().push(diff);
    }
    groups
}
