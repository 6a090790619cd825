//! Manifest records
//!
//! One YAML manifest exists per version, describing when and by whom it was
//! built and whether it has been signed. The `latest` pointer is a byte copy
//! of some version's manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::version::VersionId;

/// Errors reading or writing manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest has no version field")]
    MissingVersion,

    #[error("manifest version {0:?} is not a valid identifier")]
    MalformedVersion(String),
}

/// A detached signature over an artifact blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature algorithm identifier
    pub algorithm: String,

    /// Base64-encoded signature bytes
    pub value: String,

    /// SHA-256 fingerprint of the signing public key (hex)
    pub key_fingerprint: String,
}

/// Whether a version has been signed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SignatureState {
    #[default]
    Unsigned,
    Signed(Signature),
}

/// Metadata for one version (`manifest.<version>.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content-hash version identifier
    pub version: VersionId,

    /// When the artifact was built
    pub created_at: DateTime<Utc>,

    /// `user@host` of the builder
    pub builder: String,

    /// Signature status
    #[serde(default)]
    pub signature: SignatureState,
}

impl Manifest {
    /// Create an unsigned manifest stamped with the current time.
    pub fn new(version: VersionId, builder: impl Into<String>) -> Self {
        Self {
            version,
            created_at: Utc::now(),
            builder: builder.into(),
            signature: SignatureState::Unsigned,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self.signature {
            SignatureState::Signed(ref sig) => Some(sig),
            SignatureState::Unsigned => None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature().is_some()
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse manifest bytes from an untrusted source.
    ///
    /// The version field is checked on its own before the full record, so a
    /// malformed identifier is reported as [`ManifestError::MalformedVersion`]
    /// rather than as a generic YAML error.
    pub fn parse_untrusted(bytes: &[u8]) -> Result<Self, ManifestError> {
        let value: serde_yaml::Value = serde_yaml::from_slice(bytes)?;
        let raw = match value.get("version") {
            Some(serde_yaml::Value::String(s)) => s.clone(),
            Some(serde_yaml::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(ManifestError::MalformedVersion(
                    serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
                ))
            }
            None => return Err(ManifestError::MissingVersion),
        };
        if VersionId::parse(&raw).is_err() {
            return Err(ManifestError::MalformedVersion(raw));
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Write atomically (temp file + rename).
    pub fn write_to_file(&self, path: &Path) -> Result<(), ManifestError> {
        write_atomic(path, self.to_yaml()?.as_bytes())?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let bytes = fs::read(path)?;
        Self::parse_untrusted(&bytes)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_name = format!(
        ".tmp.{}.{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );
    let temp_path = parent.join(temp_name);
    if let Err(e) = fs::write(&temp_path, bytes) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const V: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";

    fn sample() -> Manifest {
        Manifest::new(VersionId::parse(V).unwrap(), "deploy@build01")
    }

    #[test]
    fn test_new_is_unsigned() {
        let manifest = sample();
        assert!(!manifest.is_signed());
        assert_eq!(manifest.signature, SignatureState::Unsigned);
    }

    #[test]
    fn test_yaml_shape() {
        let mut manifest = sample();
        manifest.signature = SignatureState::Signed(Signature {
            algorithm: "Ed25519".to_string(),
            value: "c2ln".to_string(),
            key_fingerprint: "ff".to_string(),
        });
        let yaml = manifest.to_yaml().unwrap();

        assert!(yaml.contains(&format!("version: {}", V)));
        assert!(yaml.contains("state: signed"));
        assert!(yaml.contains("builder: deploy@build01"));
        assert_eq!(Manifest::from_yaml(&yaml).unwrap(), manifest);
    }

    #[test]
    fn test_parse_untrusted_flags_malformed_version() {
        let yaml = "version: ../../etc/passwd\ncreated_at: 2024-01-01T00:00:00Z\nbuilder: x\n";
        let err = Manifest::parse_untrusted(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::MalformedVersion(ref v) if v == "../../etc/passwd"));
    }

    #[test]
    fn test_parse_untrusted_missing_version() {
        let yaml = "created_at: 2024-01-01T00:00:00Z\nbuilder: x\n";
        assert!(matches!(
            Manifest::parse_untrusted(yaml.as_bytes()),
            Err(ManifestError::MissingVersion)
        ));
    }

    #[test]
    fn test_unsigned_when_signature_absent() {
        let yaml = format!("version: {}\ncreated_at: 2024-01-01T00:00:00Z\nbuilder: x\n", V);
        let manifest = Manifest::parse_untrusted(yaml.as_bytes()).unwrap();
        assert!(!manifest.is_signed());
    }

    #[test]
    fn test_file_io_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("manifest.{}.yaml", V));
        sample().write_to_file(&path).unwrap();

        let loaded = Manifest::from_file(&path).unwrap();
        assert_eq!(loaded.version.as_str(), V);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
