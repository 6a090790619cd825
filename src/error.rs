//! Error taxonomy for lifecycle commands.
//!
//! Every failure is classified so the command boundary can pick an exit
//! code and flag security-relevant failures apart from routine I/O.

use std::io;
use std::path::{Path, PathBuf};

use pupistry_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::manifest::ManifestError;
use crate::tools::ToolError;
use crate::version::VersionError;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that indicate tampering or a corrupted store.
#[derive(Debug, Error)]
pub enum SecurityViolation {
    #[error("signature for version {version} does not verify against its artifact")]
    SignatureMismatch { version: String },

    #[error("{origin} holds malformed version identifier {value:?} (possible store tampering)")]
    MalformedVersion { origin: String, value: String },

    #[error("artifact content hash {actual} does not match version {expected}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{origin} describes version {found}, expected {expected}")]
    ManifestMismatch {
        origin: String,
        expected: String,
        found: String,
    },

    #[error("version {version} carries no signature but signature checking is enabled")]
    MissingSignature { version: String },
}

/// Broad class of an [`Error`], used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Collaborator,
    Consistency,
    Security,
    NotFound,
    Io,
}

/// Top-level error for lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid version argument: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("{step} failed: {source}")]
    Tool {
        step: &'static str,
        #[source]
        source: ToolError,
    },

    #[error("object store {step} failed for {key}: {source}")]
    Store {
        step: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("consistency violation on {resource}: {detail}")]
    Consistency { resource: String, detail: String },

    #[error("SECURITY: {0}")]
    Security(#[from] SecurityViolation),

    #[error("{0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn tool(step: &'static str, source: ToolError) -> Self {
        Self::Tool { step, source }
    }

    pub fn store(step: &'static str, key: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            step,
            key: key.into(),
            source,
        }
    }

    pub fn consistency(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Consistency {
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    /// Wrap a manifest read/parse failure for the file at `path`.
    pub fn manifest(path: impl AsRef<Path>, source: ManifestError) -> Self {
        match source {
            ManifestError::Io(e) => Self::io(path, e),
            other => Self::consistency(path.as_ref().display().to_string(), other.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::InvalidVersion(_) => ErrorClass::Configuration,
            Self::Tool { .. } | Self::Store { .. } => ErrorClass::Collaborator,
            Self::Consistency { .. } => ErrorClass::Consistency,
            Self::Security(_) => ErrorClass::Security,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Io { .. } => ErrorClass::Io,
        }
    }

    pub fn is_security(&self) -> bool {
        self.class() == ErrorClass::Security
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self.class() {
            ErrorClass::Io => 1,
            ErrorClass::Configuration => 2,
            ErrorClass::Collaborator => 3,
            ErrorClass::Consistency => 4,
            ErrorClass::Security => 5,
            ErrorClass::NotFound => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_errors_are_flagged() {
        let err: Error = SecurityViolation::MalformedVersion {
            origin: "manifest.latest.yaml".to_string(),
            value: "../../etc/passwd".to_string(),
        }
        .into();

        assert!(err.is_security());
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().starts_with("SECURITY:"));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            Error::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "boom")),
            Error::Config(ConfigError::Missing {
                key: "store.bucket".to_string(),
            }),
            Error::tool("archive", ToolError::Failed("tar".to_string())),
            Error::consistency("artifact.x.tar.gz", "missing"),
            Error::NotFound("nothing".to_string()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(Error::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_tool_error_names_step() {
        let err = Error::tool("source fetch", ToolError::Failed("exit status 1".to_string()));
        assert!(err.to_string().contains("source fetch failed"));
    }
}
