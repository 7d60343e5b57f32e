//! Service resource - systemd unit enablement and activity

use anyhow::Result;
use declarative::{
    ApplyContext, ApplyResult, FactProbe, Operation, ProbeError, ProbeState, ServiceTarget,
};

/// Desired enablement/activity of a systemd unit
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub unit: String,
    pub enabled: Option<bool>,
    pub running: Option<bool>,
}

impl ServiceState {
    /// Enabled at boot and running now
    pub fn running(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            enabled: Some(true),
            running: Some(true),
        }
    }

    /// Disabled and stopped
    pub fn stopped(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            enabled: Some(false),
            running: Some(false),
        }
    }

    fn label(enabled: bool, running: bool) -> String {
        format!(
            "{}, {}",
            if enabled { "enabled" } else { "disabled" },
            if running { "running" } else { "stopped" }
        )
    }
}

impl Operation for ServiceState {
    fn id(&self) -> String {
        format!("service:{}", self.unit)
    }

    fn description(&self) -> String {
        match (self.enabled, self.running) {
            (Some(false), Some(false)) => format!("Stop and disable {}", self.unit),
            (_, Some(false)) => format!("Stop {}", self.unit),
            _ => format!("Enable and start {}", self.unit),
        }
    }

    fn kind(&self) -> &'static str {
        "service"
    }

    fn probe(&self, facts: &dyn FactProbe) -> Result<ProbeState, ProbeError> {
        let svc = facts.service(&self.unit)?;
        let wants_up = self.enabled == Some(true) || self.running == Some(true);

        if !svc.loaded {
            // A unit that does not exist is already stopped and disabled
            return Ok(if wants_up {
                ProbeState::Absent
            } else {
                ProbeState::Matches
            });
        }

        let enabled_ok = self.enabled.is_none_or(|e| e == svc.enabled);
        let running_ok = self.running.is_none_or(|r| r == svc.active);
        if enabled_ok && running_ok {
            return Ok(ProbeState::Matches);
        }

        Ok(ProbeState::differs(
            Self::label(svc.enabled, svc.active),
            Self::label(
                self.enabled.unwrap_or(svc.enabled),
                self.running.unwrap_or(svc.active),
            ),
        ))
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyResult> {
        ctx.host.set_service(
            &self.unit,
            ServiceTarget {
                enabled: self.enabled,
                running: self.running,
            },
        )?;
        Ok(ApplyResult::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ServiceFact;
    use declarative::testing::FakeHost;

    #[test]
    fn test_missing_unit() {
        let host = FakeHost::new("h");
        assert_eq!(
            ServiceState::running("k3s.service").probe(&host).unwrap(),
            ProbeState::Absent
        );
        assert!(
            ServiceState::stopped("multipathd.socket")
                .probe(&host)
                .unwrap()
                .is_match()
        );
    }

    #[test]
    fn test_disabled_but_running() {
        let host = FakeHost::new("h");
        host.with_state(|s| {
            s.services.insert(
                "alloy.service".into(),
                ServiceFact {
                    loaded: true,
                    enabled: false,
                    active: true,
                },
            )
        });

        assert_eq!(
            ServiceState::running("alloy.service").probe(&host).unwrap(),
            ProbeState::differs("disabled, running", "enabled, running")
        );
    }
}
