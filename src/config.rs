use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

/// Default number of hosts converged in parallel
pub const DEFAULT_JOBS: usize = 4;

/// Default environment variable holding the secrets passphrase
pub const DEFAULT_PASSPHRASE_ENV: &str = "HOST_SECRETS_PASSWORD";

// ============================================================================
// Settings
// ============================================================================

/// Operator settings from `config.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Inventory file; relative paths resolve against the config directory
    pub inventory: String,
    /// Hosts converged in parallel
    pub jobs: usize,
    pub ssh: SshSettings,
    pub secrets: SecretSettings,
    /// Where `apply --report` writes when given without a path
    pub report_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    /// Extra `-o` options passed to every ssh call
    pub options: Vec<String>,
    /// Seconds before ssh gives up connecting
    pub connect_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretSettings {
    /// Command that reads an encrypted token on stdin and prints the plaintext
    pub command: Option<String>,
    /// Environment variable exported to the command with the passphrase
    pub passphrase_env: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inventory: "inventory.toml".to_string(),
            jobs: DEFAULT_JOBS,
            ssh: SshSettings::default(),
            secrets: SecretSettings::default(),
            report_dir: None,
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            options: Vec::new(),
            connect_timeout: 10,
        }
    }
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            command: None,
            passphrase_env: DEFAULT_PASSPHRASE_ENV.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        let dir = paths::config_dir()?;
        let mut settings = Self::load_from(&dir.join("config.toml"))?;
        settings.inventory = settings
            .inventory_path(&dir)
            .to_string_lossy()
            .to_string();
        Ok(settings)
    }

    /// Load settings from a file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        if settings.jobs == 0 {
            anyhow::bail!("{}: jobs must be at least 1", path.display());
        }
        Ok(settings)
    }

    /// Inventory path with `~` and variables expanded, relative to `base`
    pub fn inventory_path(&self, base: &Path) -> PathBuf {
        let path = paths::expand(&self.inventory);
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }

    /// Directory for run reports
    pub fn report_dir(&self) -> Result<PathBuf> {
        match &self.report_dir {
            Some(dir) => Ok(paths::expand(dir)),
            None => paths::reports_dir(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load_from(&temp.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.jobs, 4);
        assert_eq!(settings.ssh.connect_timeout, 10);
        assert_eq!(settings.secrets.passphrase_env, "HOST_SECRETS_PASSWORD");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
jobs = 8

[ssh]
options = ["StrictHostKeyChecking=accept-new"]

[secrets]
command = "age --decrypt -i ~/.config/hostwright/key.txt"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.jobs, 8);
        assert_eq!(settings.inventory, "inventory.toml");
        assert_eq!(settings.ssh.options, vec!["StrictHostKeyChecking=accept-new"]);
        assert_eq!(settings.ssh.connect_timeout, 10);
        assert!(settings.secrets.command.is_some());
        assert_eq!(settings.secrets.passphrase_env, "HOST_SECRETS_PASSWORD");
    }

    #[test]
    fn test_rejects_unknown_keys_and_zero_jobs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        fs::write(&path, "job = 3\n").unwrap();
        assert!(Settings::load_from(&path).is_err());

        fs::write(&path, "jobs = 0\n").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_inventory_path_resolution() {
        let base = Path::new("/etc/hostwright");
        let settings = Settings::default();
        assert_eq!(
            settings.inventory_path(base),
            PathBuf::from("/etc/hostwright/inventory.toml")
        );

        let settings = Settings {
            inventory: "/srv/infra/hosts.json".into(),
            ..Settings::default()
        };
        assert_eq!(
            settings.inventory_path(base),
            PathBuf::from("/srv/infra/hosts.json")
        );
    }
}
