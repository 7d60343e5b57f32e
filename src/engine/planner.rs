//! Planning - which hosts run when, and which modules each host gets

use declarative::ModulePlan;

use crate::host::HostFacts;
use crate::inventory::HostConfig;
use crate::modules::{BuildContext, ConfigError, ProvisionModule, k3s};
use crate::secrets::SecretDecryptor;

/// Hosts grouped into deployment waves
///
/// The cluster-init k3s server must be up before anything joins it, so it
/// gets a wave of its own. Everything else follows in the second wave.
/// Empty waves are dropped.
pub fn waves(hosts: Vec<HostConfig>) -> Vec<Vec<HostConfig>> {
    let (first, rest): (Vec<_>, Vec<_>) = hosts.into_iter().partition(k3s::is_cluster_init);
    [first, rest]
        .into_iter()
        .filter(|wave| !wave.is_empty())
        .collect()
}

/// A module's plan for one host, or why it could not be built
pub enum PlannedModule {
    Ready(ModulePlan),
    Rejected {
        module: &'static str,
        error: ConfigError,
    },
}

impl PlannedModule {
    pub fn module(&self) -> &str {
        match self {
            Self::Ready(plan) => &plan.module,
            Self::Rejected { module, .. } => module,
        }
    }
}

/// Build every module plan for one host
///
/// Without explicit module names a module only runs on hosts carrying its
/// block. A module named on the command line always builds, so a missing
/// block is reported instead of silently skipped.
pub fn build_plans(
    host: &HostConfig,
    facts: &HostFacts,
    secrets: &dyn SecretDecryptor,
    modules: &[Box<dyn ProvisionModule>],
    explicit: bool,
) -> Vec<PlannedModule> {
    let ctx = BuildContext::new(host, facts, secrets);
    modules
        .iter()
        .filter(|m| {
            let applies = explicit || m.applies(host);
            if !applies {
                log::debug!("{}: skipping {} (no {} block)", host.name, m.name(), m.block());
            }
            applies
        })
        .map(|m| match m.build(&ctx) {
            Ok(plan) => {
                log::debug!(
                    "{}: {} planned {} operations",
                    host.name,
                    m.name(),
                    plan.operations.len()
                );
                PlannedModule::Ready(plan)
            }
            Err(error) => PlannedModule::Rejected {
                module: m.name(),
                error,
            },
        })
        .collect()
}

/// Refuse the k3s module while the cluster it would join is not up
///
/// Other modules are left alone; they do not depend on the cluster.
pub fn hold_back(planned: Vec<PlannedModule>, reason: Option<&str>) -> Vec<PlannedModule> {
    let Some(reason) = reason else {
        return planned;
    };
    planned
        .into_iter()
        .map(|planned| match planned {
            PlannedModule::Ready(plan) if plan.module == k3s::NAME => PlannedModule::Rejected {
                module: k3s::NAME,
                error: ConfigError::guard(k3s::NAME, reason),
            },
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use crate::modules::testutil::{Reverse, facts};
    use crate::modules::{all, select};
    use serde_json::json;

    fn inventory() -> Inventory {
        Inventory::from_json(
            &json!({
                "hosts": {
                    "apollo": {"k3s_cluster": {"node_role": "server", "api_host": "k", "token": "t"}},
                    "vulkan": {"k3s_cluster": {"node_role": "cluster-init", "name": "pantheon", "api_host": "k", "token": "t"}},
                    "phobos": {"sudoers": {"user": "admin"}}
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_cluster_init_runs_first() {
        let hosts = inventory().select(&[]).unwrap();
        let waves = waves(hosts);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[0][0].name, "vulkan");
        let rest: Vec<&str> = waves[1].iter().map(|h| h.name.as_str()).collect();
        assert_eq!(rest, vec!["apollo", "phobos"]);
    }

    #[test]
    fn test_single_wave_without_cluster_init() {
        let inventory = inventory();
        let hosts = inventory.select(&["phobos".into(), "apollo".into()]).unwrap();
        assert_eq!(waves(hosts).len(), 1);
        assert!(waves(Vec::new()).is_empty());
    }

    #[test]
    fn test_full_run_skips_absent_blocks() {
        let host = inventory().host("phobos").unwrap();
        let planned = build_plans(&host, &facts(), &Reverse, &select(&[]).unwrap(), false);
        let names: Vec<&str> = planned.iter().map(PlannedModule::module).collect();
        // modules with all-optional settings still need their block
        assert_eq!(names, vec!["sudoers"]);
        assert!(matches!(planned[0], PlannedModule::Ready(_)));
    }

    #[test]
    fn test_named_module_reports_missing_block() {
        let host = inventory().host("phobos").unwrap();
        let modules = select(&["zfs".into()]).unwrap();
        let planned = build_plans(&host, &facts(), &Reverse, &modules, true);
        assert_eq!(planned.len(), 1);
        match &planned[0] {
            PlannedModule::Rejected { module, error } => {
                assert_eq!(*module, "zfs");
                assert_eq!(*error, ConfigError::missing("zfs", "zfs_config"));
            }
            PlannedModule::Ready(_) => panic!("zfs should not build without its block"),
        }
        assert_eq!(all().len(), 15);
    }
}
