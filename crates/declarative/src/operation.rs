//! Operation trait for declarative host convergence
//!
//! An Operation owns one target on a host (a file, a unit, a package set)
//! and knows how to tell whether that target already matches, and how to
//! make it match.

use crate::context::ApplyContext;
use crate::error::{GuardViolation, ProbeError};
use crate::facts::FactProbe;
use crate::types::{ApplyResult, ProbeState};
use anyhow::Result;
use std::fmt;

/// Core trait for declarative operations
///
/// Every operation provides:
/// - Identity (id, description, kind)
/// - An optional safety guard
/// - State detection through a [`FactProbe`]
/// - State convergence (apply)
///
/// `apply` is only called when `probe` did not return `Matches`, so running
/// the same operation twice in a row reports `Unchanged` the second time.
///
/// # Example
///
/// ```ignore
/// use declarative::{Operation, ProbeState, ApplyResult, ApplyContext, FactProbe, FileSpec};
///
/// #[derive(Debug)]
/// struct Motd { text: String }
///
/// impl Operation for Motd {
///     fn id(&self) -> String { "file:/etc/motd".into() }
///     fn description(&self) -> String { "Write /etc/motd".into() }
///     fn kind(&self) -> &'static str { "file" }
///
///     fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
///         Ok(match facts.file("/etc/motd")? {
///             None => ProbeState::Absent,
///             Some(f) if f.content == self.text.as_bytes() => ProbeState::Matches,
///             Some(_) => ProbeState::differs("other content", "motd"),
///         })
///     }
///
///     fn apply(&self, ctx: &mut ApplyContext) -> anyhow::Result<ApplyResult> {
///         ctx.host.write_file(&FileSpec::root("/etc/motd", "0644"), self.text.as_bytes())?;
///         Ok(ApplyResult::Changed)
///     }
/// }
/// ```
pub trait Operation: Send + Sync + fmt::Debug {
    /// Unique identifier within a plan (e.g. "file:/etc/exports")
    fn id(&self) -> String;

    /// Human-readable description of what this operation does
    fn description(&self) -> String;

    /// Operation category used for grouping and filtering
    fn kind(&self) -> &'static str;

    /// Safety check evaluated before probing
    ///
    /// Destructive operations override this to refuse running against
    /// protected targets. The default allows everything.
    fn guard(&self, _facts: &dyn FactProbe) -> Result<(), GuardViolation> {
        Ok(())
    }

    /// Compare the observed target against the desired state
    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError>;

    /// Change the host so the target matches
    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult>;

    /// Whether this operation destroys data when applied
    fn destructive(&self) -> bool {
        false
    }
}

/// A boxed operation for type-erased storage
pub type BoxedOperation = Box<dyn Operation>;
