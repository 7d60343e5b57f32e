//! Execution engine for hostwright
//!
//! The engine orchestrates:
//! 1. Planning - deployment waves and per-host module plans
//! 2. Diffing - probe pending changes for `plan`
//! 3. Executing - converge hosts in parallel, confirm destructive steps, report

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::{RunOptions, RunReport, print_summary, run};
pub use planner::{PlannedModule, build_plans};
