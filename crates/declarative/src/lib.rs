//! # Declarative
//!
//! A framework for idempotent host convergence.
//!
//! A module describes the state a host should be in as an ordered list of
//! operations. Each operation probes the host for the relevant fact and only
//! changes something when the fact does not match. Operations that changed
//! raise a change flag, which drives dependent actions (daemon reloads,
//! restarts, follow-up commands) after the module finishes.
//!
//! ## Core Concepts
//!
//! - **Operation**: One target on a host with a probe and an apply step
//! - **ProbeState**: Whether the target matches, differs or is absent
//! - **ModulePlan**: Ordered operations plus change-triggered handlers
//! - **Executor**: Runs a plan against a [`Host`], stopping at the first failure
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{execute_plan, ExecuteOptions, HandlerAction, ModulePlan, NoProgress};
//!
//! let mut plan = ModulePlan::new("exporter");
//! let unit = plan.add(unit_file_operation());
//! let svc = plan.add(service_operation());
//! plan.notify(HandlerAction::DaemonReload, &[unit.clone()]);
//! plan.notify(HandlerAction::Restart("exporter.service".into()), &[unit, svc]);
//!
//! let report = execute_plan(&plan, &host, &ExecuteOptions::default(), &mut NoProgress);
//! assert!(report.is_success());
//! ```
//!
//! ## Host Traits
//!
//! - [`FactProbe`]: Read-only fact queries
//! - [`HostExecutor`]: Mutations
//! - [`ProgressCallback`]: Receives progress updates
//! - [`ConfirmCallback`]: Handles user confirmations
//!
//! Enable the `testing` feature for an in-memory [`testing::FakeHost`].

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod facts;
pub mod host;
pub mod operation;
pub mod planner;
pub mod propagate;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

// Re-export main types at crate root
pub use context::{
    ApplyContext, AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, ProgressCallback,
};
pub use diff::{DiffSummary, OperationDiff, compute_diffs, group_by_kind};
pub use error::{Error, ExecError, GuardViolation, ProbeError};
pub use executor::{HandlerReport, ModuleReport, StepReport, execute_plan};
pub use facts::{DirectoryFact, FactProbe, FileFact, MountFact, ServiceFact, normalize_mode};
pub use host::{CommandSpec, FileSpec, Host, HostExecutor, ServiceTarget};
pub use operation::{BoxedOperation, Operation};
pub use planner::ModulePlan;
pub use propagate::{Handler, HandlerAction};
pub use types::{ApplyResult, CommandOutput, ExecuteOptions, ExecuteSummary, ProbeState};
