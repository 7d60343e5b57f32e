//! Secret decryption for inventory values
//!
//! Tokens such as the k3s cluster token are stored encrypted in the
//! inventory. Decryption runs locally through an operator-configured command
//! that reads the ciphertext on stdin and prints the plaintext. The
//! passphrase is handed to that command through an environment variable and
//! never reaches a managed host.

use thiserror::Error;

use crate::config::SecretSettings;
use crate::runner::LocalTransport;

/// Prefix marking an unencrypted value (tests, lab clusters)
pub const PLAIN_PREFIX: &str = "plain:";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("no decryption command configured (set [secrets] command in config.toml)")]
    NoCommand,

    #[error("passphrase variable {0} is not set")]
    NoPassphrase(String),

    #[error("decryption command failed: {0}")]
    Failed(String),

    #[error("decrypted value is empty")]
    Empty,
}

/// Turns an encrypted inventory token into plaintext
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, token: &str) -> Result<String, SecretError>;
}

/// Decrypts by piping the token through a local command
pub struct CommandDecryptor {
    command: Option<String>,
    passphrase_env: String,
    passphrase: Option<String>,
}

impl CommandDecryptor {
    /// Decryptor reading the passphrase from the process environment
    pub fn from_settings(settings: &SecretSettings) -> Self {
        let passphrase = std::env::var(&settings.passphrase_env).ok();
        Self::new(
            settings.command.clone(),
            &settings.passphrase_env,
            passphrase,
        )
    }

    pub fn new(command: Option<String>, passphrase_env: &str, passphrase: Option<String>) -> Self {
        Self {
            command,
            passphrase_env: passphrase_env.to_string(),
            passphrase: passphrase.filter(|p| !p.is_empty()),
        }
    }
}

impl SecretDecryptor for CommandDecryptor {
    fn decrypt(&self, token: &str) -> Result<String, SecretError> {
        if let Some(plain) = token.strip_prefix(PLAIN_PREFIX) {
            return Ok(plain.to_string());
        }

        let command = self.command.as_deref().ok_or(SecretError::NoCommand)?;
        let passphrase = self
            .passphrase
            .as_deref()
            .ok_or_else(|| SecretError::NoPassphrase(self.passphrase_env.clone()))?;

        log::debug!("Decrypting secret with `{}`", command);
        let out = LocalTransport
            .exec_with_env(
                command,
                &[(self.passphrase_env.as_str(), passphrase)],
                Some(token.trim().as_bytes()),
            )
            .map_err(|e| SecretError::Failed(e.to_string()))?;
        if !out.success() {
            return Err(SecretError::Failed(out.stderr_str().trim().to_string()));
        }

        let plain = out.stdout_str().trim().to_string();
        if plain.is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(plain)
    }
}
