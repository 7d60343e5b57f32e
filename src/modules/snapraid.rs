//! snapraid - parity configuration and scheduled sync/scrub/smart jobs

use declarative::{FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule, UnitFile, unit_spec};
use crate::resource::{AptPackages, FileContent, ServiceState};

const NAME: &str = "snapraid";
const CONF: &str = "/etc/snapraid.conf";
const WEEKDAYS: &[&str] = &["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

#[derive(Debug, Deserialize)]
struct SnapraidConfig {
    parity_disks: Vec<Disk>,
    content_files: Vec<String>,
    data_disks: Vec<Disk>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default)]
    schedule: Schedule,
}

/// A parity or data disk; extra inventory keys (uuid, mount_point) are ignored
#[derive(Debug, Deserialize)]
struct Disk {
    name: String,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Schedule {
    sync: Option<Job>,
    scrub: Option<Job>,
    smart: Option<Job>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Job {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_time")]
    time: String,
    #[serde(default = "default_frequency")]
    frequency: String,
    #[serde(default = "default_day")]
    day: String,
    #[serde(default = "default_percentage")]
    percentage: u8,
}

fn default_time() -> String {
    "03:00".to_string()
}

fn default_frequency() -> String {
    "daily".to_string()
}

fn default_day() -> String {
    "sunday".to_string()
}

fn default_percentage() -> u8 {
    10
}

impl Job {
    /// systemd `OnCalendar=` expression
    fn on_calendar(&self, job: &str) -> Result<String, ConfigError> {
        let key = |field: &str| format!("snapraid_config.schedule.{}.{}", job, field);
        let valid_time = self
            .time
            .split_once(':')
            .and_then(|(h, m)| Some((h.parse::<u8>().ok()?, m.parse::<u8>().ok()?)))
            .is_some_and(|(h, m)| h < 24 && m < 60);
        if !valid_time {
            return Err(ConfigError::invalid(
                NAME,
                &key("time"),
                format!("'{}' is not HH:MM", self.time),
            ));
        }

        match self.frequency.as_str() {
            "daily" => Ok(format!("*-*-* {}:00", self.time)),
            "weekly" => {
                let day = self.day.to_lowercase();
                let short = day.get(..3).unwrap_or_default();
                if !WEEKDAYS.contains(&short) {
                    return Err(ConfigError::invalid(
                        NAME,
                        &key("day"),
                        format!("'{}' is not a weekday", self.day),
                    ));
                }
                let mut abbrev = short.to_string();
                abbrev[..1].make_ascii_uppercase();
                Ok(format!("{} *-*-* {}:00", abbrev, self.time))
            }
            other => Err(ConfigError::invalid(
                NAME,
                &key("frequency"),
                format!("'{}' is not daily or weekly", other),
            )),
        }
    }
}

fn render_conf(config: &SnapraidConfig) -> String {
    let mut out = String::from("# Managed by hostwright\n\n");
    for disk in &config.parity_disks {
        out.push_str(&format!("{} {}\n", disk.name, disk.path));
    }
    out.push('\n');
    for file in &config.content_files {
        out.push_str(&format!("content {}\n", file));
    }
    out.push('\n');
    for disk in &config.data_disks {
        out.push_str(&format!("data {} {}\n", disk.name, disk.path));
    }
    if !config.exclude_patterns.is_empty() {
        out.push('\n');
        for pattern in &config.exclude_patterns {
            out.push_str(&format!("exclude {}\n", pattern));
        }
    }
    out
}

fn render_timer(job: &str, on_calendar: &str) -> String {
    format!(
        "[Unit]\nDescription=SnapRAID {job} timer\n\n\
         [Timer]\nOnCalendar={on_calendar}\nPersistent=true\n\n\
         [Install]\nWantedBy=timers.target\n"
    )
}

pub struct Snapraid;

impl ProvisionModule for Snapraid {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "snapraid_config"
    }

    fn description(&self) -> &'static str {
        "snapraid.conf and scheduled parity jobs"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: SnapraidConfig = ctx.block(NAME, self.block())?;
        for (key, empty) in [
            ("parity_disks", config.parity_disks.is_empty()),
            ("content_files", config.content_files.is_empty()),
            ("data_disks", config.data_disks.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::missing(NAME, &format!("snapraid_config.{}", key)));
            }
        }

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(&["snapraid", "smartmontools"]));
        plan.add(FileContent::new(
            FileSpec::root(CONF, "0644"),
            render_conf(&config),
        ));

        let jobs = [
            ("sync", &config.schedule.sync, "/usr/bin/snapraid sync".to_string()),
            ("scrub", &config.schedule.scrub, String::new()),
            ("smart", &config.schedule.smart, "/usr/bin/snapraid smart".to_string()),
        ];
        for (job, settings, command) in jobs {
            let Some(settings) = settings.as_ref().filter(|j| j.enabled) else {
                continue;
            };
            let command = if job == "scrub" {
                if settings.percentage == 0 || settings.percentage > 100 {
                    return Err(ConfigError::invalid(
                        NAME,
                        "snapraid_config.schedule.scrub.percentage",
                        "must be between 1 and 100",
                    ));
                }
                format!("/usr/bin/snapraid scrub -p {}", settings.percentage)
            } else {
                command
            };
            let on_calendar = settings.on_calendar(job)?;

            let service = UnitFile::service(format!("SnapRAID {}", job))
                .set("Type", "oneshot")
                .set("ExecStart", command)
                .without_install();
            let service_id = plan.add(FileContent::new(
                unit_spec(&format!("snapraid-{}.service", job)),
                service.render(),
            ));
            let timer = format!("snapraid-{}.timer", job);
            let timer_id = plan.add(FileContent::new(
                unit_spec(&timer),
                render_timer(job, &on_calendar),
            ));
            plan.notify(HandlerAction::DaemonReload, &[service_id, timer_id]);
            plan.add(ServiceState::running(&timer));
        }
        Ok(plan)
    }
}
