//! sudoers - sudo rights for one user

use declarative::{FileSpec, ModulePlan};
use regex::Regex;
use serde::Deserialize;

use super::{BuildContext, ConfigError, ProvisionModule};
use crate::resource::LineInFile;

const NAME: &str = "sudoers";
const SUDOERS: &str = "/etc/sudoers";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SudoersConfig {
    user: String,
    #[serde(default = "default_passwordless")]
    passwordless: bool,
}

fn default_passwordless() -> bool {
    true
}

/// The `/etc/sudoers` line granting `user` full rights
fn sudo_line(user: &str, passwordless: bool) -> String {
    if passwordless {
        format!("{} ALL=(ALL) NOPASSWD: ALL", user)
    } else {
        format!("{} ALL=(ALL) ALL", user)
    }
}

pub struct Sudoers;

impl ProvisionModule for Sudoers {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "sudoers"
    }

    fn description(&self) -> &'static str {
        "Grant a user sudo, with or without a password"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: SudoersConfig = ctx.block(NAME, self.block())?;
        if config.user.trim().is_empty() || config.user.contains(char::is_whitespace) {
            return Err(ConfigError::invalid(NAME, "sudoers.user", "must be a single user name"));
        }
        let pattern = Regex::new(&format!("^{} ", regex::escape(&config.user)))
            .map_err(|e| ConfigError::invalid(NAME, "sudoers.user", e.to_string()))?;

        let mut plan = ModulePlan::new(NAME);
        plan.add(
            LineInFile::new(
                FileSpec::root(SUDOERS, "0440"),
                sudo_line(&config.user, config.passwordless),
            )
            .replacing(pattern)
            .with_backup(),
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::testing::FakeHost;
    use serde_json::json;

    #[test]
    fn test_switch_to_password_sudo() {
        let host = FakeHost::new("h");
        host.put_file(SUDOERS, "root ALL=(ALL:ALL) ALL\nadmin ALL=(ALL) NOPASSWD: ALL\n");

        let plan = build(&Sudoers, json!({"sudoers": {"user": "admin", "passwordless": false}})).unwrap();
        assert_idempotent(&plan, &host);
        assert_eq!(
            host.file_text(SUDOERS).unwrap(),
            "root ALL=(ALL:ALL) ALL\nadmin ALL=(ALL) ALL\n"
        );
        assert_eq!(
            host.file_text("/etc/sudoers.bak").unwrap(),
            "root ALL=(ALL:ALL) ALL\nadmin ALL=(ALL) NOPASSWD: ALL\n"
        );
    }

    #[test]
    fn test_defaults_to_passwordless() {
        assert_eq!(sudo_line("deploy", true), "deploy ALL=(ALL) NOPASSWD: ALL");
        let plan = build(&Sudoers, json!({"sudoers": {"user": "deploy"}})).unwrap();
        assert_eq!(ids(&plan), vec!["line:/etc/sudoers:deploy ALL=(ALL) NOPASSWD: ALL"]);
    }

    #[test]
    fn test_user_required() {
        assert_eq!(
            build(&Sudoers, json!({"sudoers": {}})).unwrap_err(),
            ConfigError::missing(NAME, "sudoers.user")
        );
        assert!(build(&Sudoers, json!({"sudoers": {"user": "a b"}})).is_err());
    }
}
