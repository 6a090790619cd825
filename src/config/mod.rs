//! Configuration
//!
//! Implements a 3-layer merge:
//! 1. Built-in defaults
//! 2. Settings file (~/.config/pupistry/settings.toml or `--config`)
//! 3. Command-line overrides
//!
//! The merged value is deserialized into a typed [`Config`] which is passed
//! explicitly to every component. Required keys are checked once per command
//! by [`Config::validate_for`], before any side effect.

mod defaults;
mod merge;

pub use defaults::BuiltinDefaults;
pub use merge::{deep_merge, merge_layers, toml_to_json};

use pupistry_store::{Credentials, Profile, StoreLocation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Keys whose values are masked in [`Config::redacted`]
const SECRET_KEYS: &[&str] = &["password", "token", "secret", "private_key", "credential"];

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required setting `{key}`")]
    Missing { key: String },
}

/// Which command the configuration is being validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    Publish,
    Fetch,
    Install,
    Bootstrap,
}

/// Object store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// External `aws s3` client
    #[default]
    AwsCli,
    /// Local or mounted directory
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Local cache root
    pub cache_dir: PathBuf,

    /// Payload subdirectory of the working tree that gets installed
    pub payload_dir: String,

    /// Builder identity recorded in manifests (default: `$USER@hostname`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,

    /// Versions kept by cache cleanup
    pub gc_keep: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let d = BuiltinDefaults::default();
        Self {
            cache_dir: PathBuf::from(d.cache_dir),
            payload_dir: d.payload_dir,
            builder: None,
            gc_keep: d.gc_keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Whether the secrets-encryption subsystem is in use
    pub enabled: bool,

    /// Subtree holding encrypted output and node lists
    pub subtree: String,

    /// Raw, unencrypted secrets directory
    pub raw_dir: String,

    /// Program run over the working tree before archiving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_command: Option<Vec<String>>,

    /// Program run over the unpacked tree before install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypt_command: Option<Vec<String>>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        let d = BuiltinDefaults::default();
        Self {
            enabled: false,
            subtree: d.secrets_subtree,
            raw_dir: d.secrets_raw_dir,
            encrypt_command: None,
            decrypt_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Upstream source locator handed to the fetch tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Fetch program and arguments; the descriptor path is appended
    pub fetch_command: Vec<String>,

    /// Extra exclusion globs, relative to the working tree
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            source: None,
            fetch_command: BuiltinDefaults::default().fetch_command,
            exclude: Vec::new(),
            secrets: SecretsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Root directory for the `directory` backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Custom endpoint for S3-compatible services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Read/write credentials used by build and publish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Credentials>,

    /// Read-only credentials used by installers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: BuiltinDefaults::default().signing_enabled,
            private_key: None,
            public_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Installation target directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,

    pub verify_signatures: bool,

    /// Program run after a successful install; the target path is appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install_command: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            target: None,
            verify_signatures: BuiltinDefaults::default().verify_signatures,
            post_install_command: None,
        }
    }
}

/// Typed, merged configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    /// `~/.config/pupistry/settings.toml`
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".config/pupistry/settings.toml"))
    }

    /// Load and merge all layers.
    ///
    /// An explicit `path` must exist; the default path is used only if present.
    pub fn load(path: Option<&Path>, overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                layers.push(Self::load_toml_file(path)?);
            }
            None => {
                if let Some(default) = Self::default_path().filter(|p| p.exists()) {
                    layers.push(Self::load_toml_file(&default)?);
                }
            }
        }

        if let Some(cli) = overrides {
            layers.push(cli);
        }

        Self::from_value(merge_layers(layers))
    }

    /// Parse a settings document on top of the built-in defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let toml_value: toml::Value = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        Self::from_value(merge_layers(vec![
            BuiltinDefaults::default().to_value(),
            toml_to_json(toml_value),
        ]))
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.expand_home();
        Ok(config)
    }

    fn load_toml_file(path: &Path) -> Result<Value, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let toml_value: toml::Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(toml_to_json(toml_value))
    }

    fn expand_home(&mut self) {
        self.general.cache_dir = expand_tilde(&self.general.cache_dir);
        for path in [
            &mut self.agent.target,
            &mut self.signing.private_key,
            &mut self.signing.public_key,
            &mut self.store.root,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_tilde(path);
        }
    }

    /// Check that every setting `mode` depends on is present.
    pub fn validate_for(&self, mode: Mode) -> Result<(), ConfigError> {
        if self.general.payload_dir.is_empty() || self.general.payload_dir.contains('/') {
            return Err(ConfigError::Invalid(
                "general.payload_dir must be a single directory name".to_string(),
            ));
        }

        match mode {
            Mode::Build => {
                require(&self.build.source, "build.source")?;
                if self.build.fetch_command.is_empty() {
                    return Err(missing("build.fetch_command"));
                }
                if self.build.secrets.enabled {
                    require(&self.build.secrets.encrypt_command, "build.secrets.encrypt_command")?;
                }
            }
            Mode::Publish => {
                self.validate_store()?;
                if self.signing.enabled {
                    require(&self.signing.private_key, "signing.private_key")?;
                    require(&self.signing.public_key, "signing.public_key")?;
                }
            }
            Mode::Fetch | Mode::Bootstrap => self.validate_store()?,
            Mode::Install => {
                self.validate_store()?;
                self.install_target()?;
                if self.agent.verify_signatures {
                    require(&self.signing.public_key, "signing.public_key")?;
                }
                if self.build.secrets.enabled {
                    require(&self.build.secrets.decrypt_command, "build.secrets.decrypt_command")?;
                }
            }
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<(), ConfigError> {
        match self.store.bucket.as_deref() {
            Some(bucket) if !bucket.is_empty() => {}
            _ => return Err(missing("store.bucket")),
        }
        if self.store.backend == StoreBackend::Directory {
            require(&self.store.root, "store.root")?;
        }
        Ok(())
    }

    /// The configured installation target; empty or unset is an error.
    pub fn install_target(&self) -> Result<&Path, ConfigError> {
        match self.agent.target.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => Ok(path),
            _ => Err(missing("agent.target")),
        }
    }

    pub fn store_location(&self) -> Result<StoreLocation, ConfigError> {
        let bucket = self
            .store
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| missing("store.bucket"))?;
        Ok(StoreLocation::new(bucket, self.store.prefix.clone()))
    }

    pub fn credentials(&self, profile: Profile) -> Option<&Credentials> {
        match profile {
            Profile::Build => self.store.build.as_ref(),
            Profile::Agent => self.store.agent.as_ref(),
        }
    }

    /// Identity recorded in new manifests.
    pub fn builder_identity(&self) -> String {
        if let Some(ref builder) = self.general.builder {
            return builder.clone();
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        format!("{}@{}", user, hostname())
    }

    /// Effective configuration with secret values masked.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        redact_recursive(&mut value);
        value
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::Missing {
        key: key.to_string(),
    }
}

fn require<T>(value: &Option<T>, key: &str) -> Result<(), ConfigError> {
    value.as_ref().map(|_| ()).ok_or_else(|| missing(key))
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn redact_recursive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));
                if is_secret && !val.is_object() && !val.is_array() {
                    *val = Value::String("[REDACTED]".to_string());
                } else {
                    redact_recursive(val);
                }
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(redact_recursive),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL: &str = r#"
        [general]
        cache_dir = "/var/cache/pupistry"

        [build]
        source = "git@example.com:ops/control.git"

        [store]
        backend = "directory"
        bucket = "configs"
        prefix = "prod"
        root = "/srv/store"

        [store.build]
        access_key_id = "AKIABUILD"
        secret_access_key = "build-secret"

        [store.agent]
        access_key_id = "AKIAAGENT"
        secret_access_key = "agent-secret"
        region = "eu-west-1"

        [signing]
        private_key = "/etc/pupistry/signing.key"
        public_key = "/etc/pupistry/signing.pub"

        [agent]
        target = "/etc/puppetlabs/code/environments"
    "#;

    #[test]
    fn test_defaults_apply_under_file() {
        let config = Config::from_toml_str(FULL).unwrap();
        assert_eq!(config.general.payload_dir, "puppetcode");
        assert_eq!(config.general.cache_dir, PathBuf::from("/var/cache/pupistry"));
        assert!(config.signing.enabled);
        assert!(config.agent.verify_signatures);
        assert_eq!(config.store.backend, StoreBackend::Directory);
        assert_eq!(config.store.agent.as_ref().unwrap().region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_validate_for_every_mode() {
        let config = Config::from_toml_str(FULL).unwrap();
        for mode in [Mode::Build, Mode::Publish, Mode::Fetch, Mode::Install, Mode::Bootstrap] {
            config.validate_for(mode).unwrap();
        }
    }

    #[test]
    fn test_missing_bucket_is_reported() {
        let config = Config::from_toml_str("[build]\nsource = \"x\"\n").unwrap();
        config.validate_for(Mode::Build).unwrap();
        let err = config.validate_for(Mode::Fetch).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "store.bucket"));
    }

    #[test]
    fn test_empty_target_is_missing() {
        let mut config = Config::from_toml_str(FULL).unwrap();
        config.agent.target = Some(PathBuf::new());
        let err = config.validate_for(Mode::Install).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "agent.target"));
    }

    #[test]
    fn test_signing_keys_required_only_when_enabled() {
        let mut config = Config::from_toml_str(FULL).unwrap();
        config.signing.private_key = None;
        assert!(config.validate_for(Mode::Publish).is_err());
        config.signing.enabled = false;
        assert!(config.validate_for(Mode::Publish).is_ok());
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, FULL).unwrap();

        let overrides = serde_json::json!({"agent": {"target": "/tmp/override"}});
        let config = Config::load(Some(&path), Some(overrides)).unwrap();
        assert_eq!(config.agent.target, Some(PathBuf::from("/tmp/override")));
        assert_eq!(config.store.bucket.as_deref(), Some("configs"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/settings.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let config = Config::from_toml_str(FULL).unwrap();
        let redacted = config.redacted();
        assert_eq!(redacted["store"]["build"]["secret_access_key"], "[REDACTED]");
        assert_eq!(redacted["store"]["agent"]["access_key_id"], "AKIAAGENT");
        assert_eq!(redacted["signing"]["private_key"], "[REDACTED]");
        assert!(!redacted.to_string().contains("agent-secret"));
    }

    #[test]
    fn test_builder_override() {
        let mut config = Config::default();
        config.general.builder = Some("ci@runner".to_string());
        assert_eq!(config.builder_identity(), "ci@runner");
    }
}
