//! ZFS resources - pools and datasets

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, CommandSpec, FactProbe, Operation, ProbeError, ProbeState,
};
use std::collections::BTreeMap;

use super::quote;

/// An imported ZFS pool, created on its devices if missing
#[derive(Debug, Clone)]
pub struct ZfsPool {
    pub name: String,
    /// Vdev type such as `mirror` or `raidz`; `None` stripes
    pub vdev_type: Option<String>,
    pub devices: Vec<String>,
    pub ashift: Option<u32>,
}

impl ZfsPool {
    pub(crate) fn create_command(&self) -> String {
        let mut parts = vec!["zpool".to_string(), "create".to_string()];
        if let Some(ashift) = self.ashift {
            parts.push("-o".to_string());
            parts.push(format!("ashift={}", ashift));
        }
        parts.push(quote(&self.name));
        if let Some(vdev) = &self.vdev_type {
            parts.push(quote(vdev));
        }
        parts.extend(self.devices.iter().map(|d| quote(d)));
        parts.join(" ")
    }
}

impl Operation for ZfsPool {
    fn id(&self) -> String {
        format!("zpool:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Create ZFS pool {} on {}", self.name, self.devices.join(", "))
    }

    fn kind(&self) -> &'static str {
        "zfs"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        Ok(ProbeState::present_if(
            facts.zfs_pools()?.iter().any(|p| p == &self.name),
        ))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.run(&CommandSpec::root(self.create_command()))?;
        Ok(ApplyResult::Changed)
    }

    fn destructive(&self) -> bool {
        true
    }
}

/// A ZFS dataset with properties
#[derive(Debug, Clone)]
pub struct ZfsDataset {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

impl ZfsDataset {
    fn drift(&self, current: &BTreeMap<String, String>) -> Vec<(String, String)> {
        self.properties
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn property_args(props: &[(String, String)], flag: &str) -> String {
        props
            .iter()
            .map(|(k, v)| format!("{}{}", flag, quote(&format!("{}={}", k, v))))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Operation for ZfsDataset {
    fn id(&self) -> String {
        format!("zfs:{}", self.name)
    }

    fn description(&self) -> String {
        format!("ZFS dataset {}", self.name)
    }

    fn kind(&self) -> &'static str {
        "zfs"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let Some(current) = facts.zfs_dataset(&self.name)? else {
            return Ok(ProbeState::Absent);
        };
        let drift = self.drift(&current);
        if drift.is_empty() {
            return Ok(ProbeState::Matches);
        }
        let have: Vec<String> = drift
            .iter()
            .map(|(k, _)| {
                format!("{}={}", k, current.get(k).map_or("-", String::as_str))
            })
            .collect();
        let want: Vec<String> = drift.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Ok(ProbeState::differs(have.join(" "), want.join(" ")))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        let script = match ctx.facts.zfs_dataset(&self.name)? {
            None => {
                let props: Vec<(String, String)> = self
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let args = Self::property_args(&props, "-o ");
                if args.is_empty() {
                    format!("zfs create -p {}", quote(&self.name))
                } else {
                    format!("zfs create -p {} {}", args, quote(&self.name))
                }
            }
            Some(current) => {
                let drift = self.drift(&current);
                if drift.is_empty() {
                    return Ok(ApplyResult::Unchanged);
                }
                format!(
                    "zfs set {} {}",
                    Self::property_args(&drift, ""),
                    quote(&self.name)
                )
            }
        };
        ctx.host.run(&CommandSpec::root(script))?;
        Ok(ApplyResult::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_create_command() {
        let pool = ZfsPool {
            name: "tank".into(),
            vdev_type: Some("mirror".into()),
            devices: vec!["/dev/sdb".into(), "/dev/sdc".into()],
            ashift: Some(12),
        };
        assert_eq!(
            pool.create_command(),
            "zpool create -o ashift=12 tank mirror /dev/sdb /dev/sdc"
        );
    }

    #[test]
    fn test_dataset_drift() {
        let ds = ZfsDataset {
            name: "tank/media".into(),
            properties: BTreeMap::from([
                ("compression".to_string(), "lz4".to_string()),
                ("mountpoint".to_string(), "/export/media".to_string()),
            ]),
        };
        let current = BTreeMap::from([
            ("compression".to_string(), "off".to_string()),
            ("mountpoint".to_string(), "/export/media".to_string()),
        ]);
        assert_eq!(
            ds.drift(&current),
            vec![("compression".to_string(), "lz4".to_string())]
        );
        assert_eq!(
            ZfsDataset::property_args(&ds.drift(&current), ""),
            "compression=lz4"
        );
    }
}
