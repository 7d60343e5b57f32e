//! Pending changes - what `plan` shows before anything is applied

use colored::Colorize;
use declarative::{DiffSummary, FactProbe, OperationDiff, ProbeState, compute_diffs, group_by_kind};
use similar::{ChangeTag, TextDiff};

use super::planner::PlannedModule;
use crate::ui;

/// Probe results for one module on one host
pub struct ModulePending {
    pub module: String,
    /// Pending changes, or the build/probe failure that prevented probing
    pub result: Result<Vec<OperationDiff>, String>,
}

impl ModulePending {
    pub fn has_changes(&self) -> bool {
        self.result.as_ref().is_ok_and(|diffs| !diffs.is_empty())
    }
}

/// Probe every planned module against current facts
///
/// Later operations are probed against today's state, not the state earlier
/// operations would leave behind, so a service whose unit file is not
/// written yet shows as absent.
pub fn pending(planned: &[PlannedModule], facts: &dyn FactProbe) -> Vec<ModulePending> {
    planned
        .iter()
        .map(|p| match p {
            PlannedModule::Ready(plan) => ModulePending {
                module: plan.module.clone(),
                result: compute_diffs(&plan.operations, facts).map_err(|e| e.to_string()),
            },
            PlannedModule::Rejected { module, error } => ModulePending {
                module: (*module).to_string(),
                result: Err(error.to_string()),
            },
        })
        .collect()
}

/// Changed lines between two texts, without context
pub fn changed_lines(current: &str, desired: &str) -> Vec<String> {
    TextDiff::from_lines(current, desired)
        .iter_all_changes()
        .filter_map(|change| match change.tag() {
            ChangeTag::Delete => Some(format!("- {}", change.value().trim_end_matches('\n'))),
            ChangeTag::Insert => Some(format!("+ {}", change.value().trim_end_matches('\n'))),
            ChangeTag::Equal => None,
        })
        .collect()
}

fn show_text_diff(current: &str, desired: &str) {
    for line in changed_lines(current, desired) {
        let colored = if line.starts_with('-') {
            line.red()
        } else {
            line.green()
        };
        println!("      {}", colored);
    }
}

fn show_diff(diff: &OperationDiff) {
    let marker = if diff.destructive {
        format!(" {}", "[destructive]".red().bold())
    } else {
        String::new()
    };
    println!(
        "    {} {}{}",
        ui::state_symbol(&diff.state),
        diff.description,
        marker
    );

    if let ProbeState::Differs { current, desired } = &diff.state {
        if current.contains('\n') || desired.contains('\n') {
            show_text_diff(current, desired);
        } else {
            println!(
                "      {} → {}",
                ui::preview(current, 50).dimmed(),
                ui::preview(desired, 50)
            );
        }
    }
}

/// Print one host's pending changes
pub fn display_host(host: &str, modules: &[ModulePending]) {
    ui::section(host);
    if modules.is_empty() {
        ui::dim("no modules apply to this host");
        return;
    }

    for pending in modules {
        match &pending.result {
            Err(reason) => println!("  {} {}: {}", "✗".red(), pending.module.bold(), reason),
            Ok(diffs) if diffs.is_empty() => {
                println!("  {} {}", "✓".green(), pending.module.bold());
            }
            Ok(diffs) => {
                let summary = DiffSummary::from_diffs(diffs);
                println!(
                    "  {} {} ({} to add, {} to change)",
                    "~".yellow(),
                    pending.module.bold(),
                    summary.additions,
                    summary.modifications
                );
                for (kind, group) in group_by_kind(diffs) {
                    println!("   {}", kind.dimmed());
                    for diff in group {
                        show_diff(diff);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::sudoers::Sudoers;
    use crate::modules::testutil::build;
    use declarative::testing::FakeHost;
    use serde_json::json;

    #[test]
    fn test_changed_lines() {
        let lines = changed_lines("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(lines, vec!["- b", "+ B", "+ d"]);
        assert!(changed_lines("same\n", "same\n").is_empty());
    }

    #[test]
    fn test_pending_per_module() {
        let host = FakeHost::new("h");
        host.put_file("/etc/sudoers", "root ALL=(ALL:ALL) ALL\n");
        let plan = build(&Sudoers, json!({"sudoers": {"user": "admin"}})).unwrap();
        let planned = vec![
            PlannedModule::Ready(plan),
            PlannedModule::Rejected {
                module: "zfs",
                error: crate::modules::ConfigError::missing("zfs", "zfs_config"),
            },
        ];

        let modules = pending(&planned, &host);
        assert_eq!(modules.len(), 2);
        assert!(modules[0].has_changes());
        assert_eq!(modules[0].result.as_ref().unwrap()[0].kind, "file");
        assert!(!modules[1].has_changes());
        assert!(modules[1].result.as_ref().unwrap_err().contains("zfs_config"));

        host.put_file("/etc/sudoers", "admin ALL=(ALL) NOPASSWD: ALL\n");
        let planned = vec![PlannedModule::Ready(
            build(&Sudoers, json!({"sudoers": {"user": "admin"}})).unwrap(),
        )];
        assert!(!pending(&planned, &host)[0].has_changes());
    }
}
