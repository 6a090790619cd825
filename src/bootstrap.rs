//! Agent bootstrap material
//!
//! Renders a shell script that writes an agent settings file (plus the
//! verification key) and runs the first apply. Only the read-only agent
//! credential profile is ever embedded.

use std::fs;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use pupistry_store::{Credentials, Profile};
use serde::Serialize;

use crate::config::{Config, ConfigError, StoreBackend};
use crate::error::{Error, Result};

const TEMPLATE_NAME: &str = "bootstrap";

/// Directory the generated script installs settings into
pub const DEFAULT_AGENT_CONFIG_DIR: &str = "/etc/pupistry";

const DEFAULT_TEMPLATE: &str = r#"#!/bin/sh
# pupistry agent bootstrap for {{store_url}}
set -eu
umask 077
mkdir -p {{config_dir}}
{{#if public_key}}
cat > {{config_dir}}/signing.pub <<'PUPISTRY_KEY'
{{public_key}}
PUPISTRY_KEY
{{/if}}
cat > {{config_dir}}/settings.toml <<'PUPISTRY_SETTINGS'
[general]
cache_dir = {{toml.cache_dir}}
payload_dir = {{toml.payload_dir}}
{{#if secrets}}

[build.secrets]
enabled = true
subtree = {{secrets.subtree}}
raw_dir = {{secrets.raw_dir}}
decrypt_command = {{secrets.decrypt_command}}
{{/if}}

[store]
backend = {{toml.backend}}
bucket = {{toml.bucket}}
{{#if toml.prefix}}
prefix = {{toml.prefix}}
{{/if}}
{{#if toml.root}}
root = {{toml.root}}
{{/if}}
{{#if toml.endpoint}}
endpoint = {{toml.endpoint}}
{{/if}}
{{#if credentials}}

[store.agent]
access_key_id = {{credentials.access_key_id}}
secret_access_key = {{credentials.secret_access_key}}
{{#if credentials.region}}
region = {{credentials.region}}
{{/if}}
{{/if}}

[signing]
enabled = false
{{#if public_key}}
public_key = {{toml.public_key}}
{{/if}}

[agent]
target = {{toml.target}}
verify_signatures = {{verify_signatures}}
PUPISTRY_SETTINGS

pupistry --config {{config_dir}}/settings.toml apply
"#;

/// Values handed to the template. `config_dir` is shell-quoted; strings
/// under `toml`, `secrets` and `credentials` are quoted TOML literals.
#[derive(Debug, Serialize)]
struct BootstrapContext {
    store_url: String,
    config_dir: String,
    public_key: Option<String>,
    verify_signatures: bool,
    toml: TomlValues,
    secrets: Option<TomlSecrets>,
    credentials: Option<TomlCredentials>,
}

#[derive(Debug, Serialize)]
struct TomlValues {
    cache_dir: String,
    payload_dir: String,
    backend: String,
    bucket: String,
    prefix: Option<String>,
    root: Option<String>,
    endpoint: Option<String>,
    target: String,
    public_key: String,
}

#[derive(Debug, Serialize)]
struct TomlSecrets {
    subtree: String,
    raw_dir: String,
    decrypt_command: String,
}

#[derive(Debug, Serialize)]
struct TomlCredentials {
    access_key_id: String,
    secret_access_key: String,
    region: Option<String>,
}

/// Render bootstrap material for agents from `config`.
///
/// `template` replaces the built-in script template when given.
pub fn render(config: &Config, template: Option<&Path>, config_dir: &Path) -> Result<String> {
    let context = build_context(config, config_dir)?;

    let source = match template {
        Some(path) => fs::read_to_string(path).map_err(|e| Error::io(path, e))?,
        None => DEFAULT_TEMPLATE.to_string(),
    };

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string(TEMPLATE_NAME, source)
        .map_err(|e| ConfigError::Invalid(format!("bootstrap template: {}", e)))?;
    let rendered = handlebars
        .render(TEMPLATE_NAME, &context)
        .map_err(|e| ConfigError::Invalid(format!("bootstrap template: {}", e)))?;
    Ok(rendered)
}

fn build_context(config: &Config, config_dir: &Path) -> Result<BootstrapContext> {
    let location = config.store_location()?;
    let target = config.install_target()?;

    let agent = config.credentials(Profile::Agent);
    if let (Some(agent), Some(build)) = (agent, config.credentials(Profile::Build)) {
        if agent.access_key_id == build.access_key_id {
            return Err(ConfigError::Invalid(
                "agent credentials are the build credentials; refusing to hand out write access"
                    .to_string(),
            )
            .into());
        }
    }
    if agent.is_none() && config.store.backend == StoreBackend::AwsCli {
        return Err(ConfigError::Missing {
            key: "store.agent".to_string(),
        }
        .into());
    }

    let verify_signatures = config.agent.verify_signatures;
    let public_key = match config.signing.public_key.as_deref() {
        Some(path) => Some(
            fs::read_to_string(path)
                .map_err(|e| Error::io(path, e))?
                .trim()
                .to_string(),
        ),
        None if verify_signatures => {
            return Err(ConfigError::Missing {
                key: "signing.public_key".to_string(),
            }
            .into())
        }
        None => None,
    };

    let secrets = if config.build.secrets.enabled {
        let command = config.build.secrets.decrypt_command.as_ref().ok_or_else(|| {
            ConfigError::Missing {
                key: "build.secrets.decrypt_command".to_string(),
            }
        })?;
        Some(TomlSecrets {
            subtree: toml_str(&config.build.secrets.subtree),
            raw_dir: toml_str(&config.build.secrets.raw_dir),
            decrypt_command: toml_array(command),
        })
    } else {
        None
    };

    let backend = match config.store.backend {
        StoreBackend::AwsCli => "aws-cli",
        StoreBackend::Directory => "directory",
    };

    Ok(BootstrapContext {
        store_url: location.to_string(),
        config_dir: shell_quote(&config_dir.display().to_string()),
        public_key,
        verify_signatures,
        toml: TomlValues {
            cache_dir: toml_path(&config.general.cache_dir),
            payload_dir: toml_str(&config.general.payload_dir),
            backend: toml_str(backend),
            bucket: toml_str(&location.bucket),
            prefix: config.store.prefix.as_deref().map(toml_str),
            root: config.store.root.as_deref().map(toml_path),
            endpoint: config.store.endpoint.as_deref().map(toml_str),
            target: toml_path(target),
            public_key: toml_path(&config_dir.join("signing.pub")),
        },
        secrets,
        credentials: agent.map(toml_credentials),
    })
}

fn toml_credentials(creds: &Credentials) -> TomlCredentials {
    TomlCredentials {
        access_key_id: toml_str(&creds.access_key_id),
        secret_access_key: toml_str(&creds.secret_access_key),
        region: creds.region.as_deref().map(toml_str),
    }
}

/// Quoted, escaped TOML string literal.
fn toml_str(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_path(path: &Path) -> String {
    toml_str(&path.display().to_string())
}

fn toml_array(items: &[String]) -> String {
    toml::Value::Array(items.iter().cloned().map(toml::Value::String).collect()).to_string()
}

/// Single-quoted POSIX shell word.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Default settings directory on agents.
pub fn default_config_dir() -> PathBuf {
    PathBuf::from(DEFAULT_AGENT_CONFIG_DIR)
}
