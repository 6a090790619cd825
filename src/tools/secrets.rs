//! Secrets-encryption subsystem seam.
//!
//! Encryption runs over the working tree before it is archived; decryption
//! runs over an unpacked tree before it is installed. Both are delegated to
//! configured external programs which receive the tree path as their last
//! argument.

use std::path::Path;

use tracing::debug;

use super::{run_command, ToolError};
use crate::config::SecretsConfig;

pub trait Secrets {
    fn is_enabled(&self) -> bool;

    fn encrypt(&self, tree: &Path) -> Result<(), ToolError>;

    fn decrypt(&self, tree: &Path) -> Result<(), ToolError>;
}

/// Runs the configured encrypt/decrypt programs.
#[derive(Debug, Clone)]
pub struct CommandSecrets {
    enabled: bool,
    encrypt_command: Option<Vec<String>>,
    decrypt_command: Option<Vec<String>>,
}

impl CommandSecrets {
    pub fn from_config(config: &SecretsConfig) -> Self {
        Self {
            enabled: config.enabled,
            encrypt_command: config.encrypt_command.clone(),
            decrypt_command: config.decrypt_command.clone(),
        }
    }

    /// A subsystem that is switched off; both operations do nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            encrypt_command: None,
            decrypt_command: None,
        }
    }

    fn run(&self, action: &str, command: Option<&Vec<String>>, tree: &Path) -> Result<(), ToolError> {
        if !self.enabled {
            return Ok(());
        }
        let command = command
            .ok_or_else(|| ToolError::Failed(format!("secrets enabled but no {} command set", action)))?;
        debug!("running secrets {} over {}", action, tree.display());
        run_command(command, &[tree.as_os_str()], Some(tree))
    }
}

impl Secrets for CommandSecrets {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn encrypt(&self, tree: &Path) -> Result<(), ToolError> {
        self.run("encrypt", self.encrypt_command.as_ref(), tree)
    }

    fn decrypt(&self, tree: &Path) -> Result<(), ToolError> {
        self.run("decrypt", self.decrypt_command.as_ref(), tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch_command(marker: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch \"$0/{}\"", marker),
        ]
    }

    #[test]
    fn test_disabled_is_noop() {
        let dir = TempDir::new().unwrap();
        let secrets = CommandSecrets::disabled();
        assert!(!secrets.is_enabled());
        secrets.encrypt(dir.path()).unwrap();
        secrets.decrypt(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_enabled_runs_commands_with_tree_path() {
        let dir = TempDir::new().unwrap();
        let config = SecretsConfig {
            enabled: true,
            encrypt_command: Some(touch_command("encrypted")),
            decrypt_command: Some(touch_command("decrypted")),
            ..SecretsConfig::default()
        };
        let secrets = CommandSecrets::from_config(&config);

        secrets.encrypt(dir.path()).unwrap();
        secrets.decrypt(dir.path()).unwrap();
        assert!(dir.path().join("encrypted").exists());
        assert!(dir.path().join("decrypted").exists());
    }

    #[test]
    fn test_enabled_without_command_fails() {
        let dir = TempDir::new().unwrap();
        let config = SecretsConfig {
            enabled: true,
            ..SecretsConfig::default()
        };
        let err = CommandSecrets::from_config(&config).decrypt(dir.path()).unwrap_err();
        assert!(err.to_string().contains("decrypt"));
    }
}
