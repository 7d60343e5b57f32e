//! Centralized path resolution for hostwright
//!
//! # Environment Variables
//!
//! - `HOSTWRIGHT_CONFIG_DIR` - Override config directory (e.g., `~/infra/hostwright`)
//! - `HOSTWRIGHT_STATE_DIR` - Override state directory (run reports)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `HOSTWRIGHT_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/hostwright` (if set)
//! 3. `~/.config/hostwright`
//!
//! For state_dir():
//! 1. `HOSTWRIGHT_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/hostwright` (if set)
//! 3. `~/.local/state/hostwright`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "HOSTWRIGHT_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "HOSTWRIGHT_STATE_DIR";

const APP_DIR: &str = "hostwright";

/// Get the hostwright config directory path
pub fn config_dir() -> Result<PathBuf> {
    resolve(
        ENV_CONFIG_DIR,
        "XDG_CONFIG_HOME",
        &[".config"],
        |key| std::env::var(key).ok(),
        dirs::home_dir().as_deref(),
    )
}

/// Get the hostwright state directory path
pub fn state_dir() -> Result<PathBuf> {
    resolve(
        ENV_STATE_DIR,
        "XDG_STATE_HOME",
        &[".local", "state"],
        |key| std::env::var(key).ok(),
        dirs::home_dir().as_deref(),
    )
}

/// Directory for JSON run reports
pub fn reports_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("reports"))
}

fn resolve(
    override_var: &str,
    xdg_var: &str,
    home_default: &[&str],
    env: impl Fn(&str) -> Option<String>,
    home: Option<&Path>,
) -> Result<PathBuf> {
    // 1. Explicit override
    if let Some(dir) = env(override_var) {
        let path = expand(&dir);
        log::debug!("Using {} from {}", path.display(), override_var);
        return Ok(path);
    }

    // 2. XDG base directory
    if let Some(xdg) = env(xdg_var).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(xdg).join(APP_DIR);
        log::debug!("Using {}: {}", xdg_var, path.display());
        return Ok(path);
    }

    // 3. Home default
    let home = home.context("Could not determine home directory")?;
    let mut path = home.to_path_buf();
    for part in home_default {
        path.push(part);
    }
    path.push(APP_DIR);
    log::debug!("Using default dir: {}", path.display());
    Ok(path)
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as-is.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================
