//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for every configuration value that has one.

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Local cache root (default: ~/.pupistry/cache)
    pub cache_dir: String,

    /// Payload subdirectory inside the working tree (default: "puppetcode")
    pub payload_dir: String,

    /// Source fetch program and leading arguments; the descriptor path is appended
    pub fetch_command: Vec<String>,

    /// Secrets subtree name (default: "hieracrypt")
    pub secrets_subtree: String,

    /// Raw, unencrypted secrets directory (default: "hieradata")
    pub secrets_raw_dir: String,

    /// Object store backend (default: "aws-cli")
    pub store_backend: String,

    /// Sign artifacts on publish (default: true)
    pub signing_enabled: bool,

    /// Verify signatures before install (default: true)
    pub verify_signatures: bool,

    /// Versions kept by `gc` (default: 5)
    pub gc_keep: usize,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            cache_dir: "~/.pupistry/cache".to_string(),
            payload_dir: "puppetcode".to_string(),
            fetch_command: vec![
                "r10k".to_string(),
                "deploy".to_string(),
                "environment".to_string(),
                "--puppetfile".to_string(),
                "--config".to_string(),
            ],
            secrets_subtree: "hieracrypt".to_string(),
            secrets_raw_dir: "hieradata".to_string(),
            store_backend: "aws-cli".to_string(),
            signing_enabled: true,
            verify_signatures: true,
            gc_keep: 5,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "general": {
                "cache_dir": self.cache_dir,
                "payload_dir": self.payload_dir,
                "gc_keep": self.gc_keep
            },
            "build": {
                "fetch_command": self.fetch_command,
                "secrets": {
                    "enabled": false,
                    "subtree": self.secrets_subtree,
                    "raw_dir": self.secrets_raw_dir
                }
            },
            "store": {
                "backend": self.store_backend
            },
            "signing": {
                "enabled": self.signing_enabled
            },
            "agent": {
                "verify_signatures": self.verify_signatures
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_secure() {
        let defaults = BuiltinDefaults::default();
        assert!(defaults.signing_enabled);
        assert!(defaults.verify_signatures);
    }

    #[test]
    fn test_to_value_shape() {
        let value = BuiltinDefaults::default().to_value();
        assert_eq!(value["general"]["payload_dir"], "puppetcode");
        assert_eq!(value["build"]["secrets"]["enabled"], false);
        assert_eq!(value["agent"]["verify_signatures"], true);
        assert!(value["build"]["fetch_command"].is_array());
    }
}
