//! Apply context and callback traits
//!
//! These traits allow the declarative crate to be used without
//! depending on a specific terminal UI.

use crate::facts::FactProbe;
use crate::host::HostExecutor;
use crate::types::ApplyResult;
use anyhow::Result;

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send {
    /// Called when a module starts
    fn on_module_start(&mut self, module: &str, operations: usize);

    /// Called when starting to apply a single operation
    fn on_operation_start(&mut self, id: &str, description: &str);

    /// Called when an operation completes
    fn on_operation_complete(&mut self, id: &str, result: &ApplyResult);

    /// Called when a module finishes (successfully or not)
    fn on_module_complete(&mut self, module: &str, success: bool);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_module_start(&mut self, _module: &str, _operations: usize) {}
    fn on_operation_start(&mut self, _id: &str, _description: &str) {}
    fn on_operation_complete(&mut self, _id: &str, _result: &ApplyResult) {}
    fn on_module_complete(&mut self, _module: &str, _success: bool) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Context passed to operation apply calls
pub struct ApplyContext<'a> {
    /// Whether to output verbose information
    pub verbose: bool,
    /// The host being changed
    pub host: &'a dyn HostExecutor,
    /// Fresh facts for operations that compute their change from current state
    pub facts: &'a dyn FactProbe,
}

impl<'a> ApplyContext<'a> {
    /// Create a new apply context
    pub fn new(host: &'a dyn HostExecutor, facts: &'a dyn FactProbe, verbose: bool) -> Self {
        Self {
            verbose,
            host,
            facts,
        }
    }
}
