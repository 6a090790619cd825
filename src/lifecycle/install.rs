//! Install orchestrator
//!
//! Per version: `fetched -> unpacked -> verified -> installed`.
//!
//! - Unpack always deletes the version's scratch directory first, so a
//!   half-extracted directory from a crash is never reused
//! - Extraction re-hashes the archive and refuses content whose hash is not
//!   the version identifier
//! - Install empties the target before copying; a failed install is
//!   recovered by running install again

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::ArtifactFetcher;
use crate::cache::Cache;
use crate::config::{Config, ConfigError};
use crate::error::{Error, Result, SecurityViolation};
use crate::manifest::{write_atomic, Manifest};
use crate::tools::{run_command, Archiver, Secrets, Signer, ToolError};
use crate::version::{VersionId, VersionSelector};

/// Install record written into the target
pub const INSTALL_RECORD: &str = "manifest.pupistry.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(VersionId),
    /// The target already runs this version; nothing changed
    AlreadyInstalled(VersionId),
}

pub struct Installer<'a> {
    config: &'a Config,
    cache: &'a Cache,
    archiver: &'a dyn Archiver,
    secrets: &'a dyn Secrets,
    verifier: Option<&'a dyn Signer>,
}

impl<'a> Installer<'a> {
    pub fn new(
        config: &'a Config,
        cache: &'a Cache,
        archiver: &'a dyn Archiver,
        secrets: &'a dyn Secrets,
    ) -> Self {
        Self {
            config,
            cache,
            archiver,
            secrets,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: &'a dyn Signer) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Extract `version` into a fresh scratch directory.
    pub fn unpack(&self, version: &VersionId) -> Result<PathBuf> {
        self.require_fetched(version)?;

        let scratch = self.cache.unpacked_dir(version);
        if scratch.exists() {
            debug!("removing stale {}", scratch.display());
            fs::remove_dir_all(&scratch).map_err(|e| Error::io(&scratch, e))?;
        }
        fs::create_dir_all(&scratch).map_err(|e| Error::io(&scratch, e))?;

        let blob = self.cache.artifact_path(version);
        let actual = match self.archiver.extract(&blob, &scratch) {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_dir_all(&scratch);
                return Err(Error::tool("extraction", e));
            }
        };
        if actual != *version {
            let _ = fs::remove_dir_all(&scratch);
            return Err(SecurityViolation::ChecksumMismatch {
                expected: version.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }

        info!("unpacked {} into {}", version, scratch.display());
        Ok(scratch)
    }

    /// Check the manifest signature against the blob.
    ///
    /// A rejected version's scratch directory is deleted so nothing from
    /// an untrusted blob stays on disk.
    pub fn verify(&self, version: &VersionId) -> Result<()> {
        let checked = self.check_signature(version);
        if let Err(ref e) = checked {
            if e.is_security() {
                let scratch = self.cache.unpacked_dir(version);
                if scratch.exists() {
                    warn!("discarding unverified {}", scratch.display());
                    fs::remove_dir_all(&scratch).map_err(|e| Error::io(&scratch, e))?;
                }
            }
        }
        checked
    }

    fn check_signature(&self, version: &VersionId) -> Result<()> {
        if !self.config.agent.verify_signatures {
            warn!("signature checking is disabled; installing {} unverified", version);
            return Ok(());
        }
        let verifier = self.verifier.ok_or_else(|| ConfigError::Missing {
            key: "signing.public_key".to_string(),
        })?;

        let manifest = self.require_fetched(version)?;
        let signature = manifest
            .signature()
            .ok_or_else(|| SecurityViolation::MissingSignature {
                version: version.to_string(),
            })?;

        let valid = verifier
            .verify(&self.cache.artifact_path(version), signature)
            .map_err(|e| Error::tool("signature verification", e.into()))?;
        if !valid {
            return Err(SecurityViolation::SignatureMismatch {
                version: version.to_string(),
            }
            .into());
        }
        info!("signature for {} verified", version);
        Ok(())
    }

    /// Run the secrets decryption step over the unpacked payload.
    pub fn decrypt(&self, version: &VersionId) -> Result<()> {
        if !self.secrets.is_enabled() {
            return Ok(());
        }
        let payload = self.payload_dir(version)?;
        self.secrets
            .decrypt(&payload)
            .map_err(|e| Error::tool("secrets decryption", e))
    }

    /// Empty the install target, or create it (mode 0700) if missing.
    pub fn clean_target(&self) -> Result<PathBuf> {
        let target = self.config.install_target()?.to_path_buf();

        if !target.exists() {
            create_private_dir(&target)?;
            info!("created install target {}", target.display());
            return Ok(target);
        }
        if !target.is_dir() {
            return Err(Error::Config(ConfigError::Invalid(format!(
                "install target {} is not a directory",
                target.display()
            ))));
        }

        for entry in fs::read_dir(&target).map_err(|e| Error::io(&target, e))? {
            let path = entry.map_err(|e| Error::io(&target, e))?.path();
            let meta = fs::symlink_metadata(&path).map_err(|e| Error::io(&path, e))?;
            let removed = if meta.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| Error::io(&path, e))?;
        }
        debug!("cleaned install target {}", target.display());
        Ok(target)
    }

    /// Clean the target, copy the payload in and write the install record.
    ///
    /// The signature gate runs again here, so callers cannot install a
    /// version that has not passed [`Installer::verify`].
    pub fn install(&self, version: &VersionId) -> Result<()> {
        let payload = self.payload_dir(version)?;
        self.verify(version)?;
        let manifest_path = self.cache.manifest_path(version);
        let record = fs::read(&manifest_path).map_err(|e| Error::io(&manifest_path, e))?;

        let target = self.clean_target()?;
        copy_tree(&payload, &target)?;

        let record_path = target.join(INSTALL_RECORD);
        write_atomic(&record_path, &record).map_err(|e| Error::io(&record_path, e))?;
        info!("installed {} into {}", version, target.display());
        Ok(())
    }

    /// Version named by the local latest pointer; no store access.
    pub fn latest_fetched(&self) -> Result<Option<VersionId>> {
        self.cache.latest()
    }

    /// Version recorded in the install target, if any.
    pub fn installed_version(&self) -> Result<Option<VersionId>> {
        let Some(target) = self.config.agent.target.as_deref() else {
            return Ok(None);
        };
        let record = target.join(INSTALL_RECORD);
        if target.as_os_str().is_empty() || !record.is_file() {
            return Ok(None);
        }
        let manifest = Manifest::from_file(&record).map_err(|e| Error::manifest(&record, e))?;
        Ok(Some(manifest.version))
    }

    /// Fetch, unpack, verify, decrypt and install in one pass.
    ///
    /// Skips everything after the fetch when the target already runs the
    /// resolved version, unless `force` is set.
    pub fn apply(
        &self,
        fetcher: &ArtifactFetcher<'_>,
        selector: &VersionSelector,
        force: bool,
    ) -> Result<ApplyOutcome> {
        let version = fetcher.fetch(selector)?;
        if !force && self.installed_version()?.as_ref() == Some(&version) {
            info!("version {} is already installed", version);
            return Ok(ApplyOutcome::AlreadyInstalled(version));
        }

        self.unpack(&version)?;
        self.verify(&version)?;
        self.decrypt(&version)?;
        self.install(&version)?;

        if let Some(ref command) = self.config.agent.post_install_command {
            let target = self.config.install_target()?;
            run_command(command, &[target.as_os_str()], None)
                .map_err(|e| Error::tool("post-install command", e))?;
        }
        Ok(ApplyOutcome::Applied(version))
    }

    fn require_fetched(&self, version: &VersionId) -> Result<Manifest> {
        if !self.cache.has_version(version) {
            return Err(Error::consistency(
                self.cache.artifact_path(version).display().to_string(),
                format!("version {} has not been fetched", version),
            ));
        }
        self.cache.read_manifest(version)
    }

    fn payload_dir(&self, version: &VersionId) -> Result<PathBuf> {
        let payload = self
            .cache
            .unpacked_dir(version)
            .join(&self.config.general.payload_dir);
        if !payload.is_dir() {
            return Err(Error::consistency(
                payload.display().to_string(),
                format!("version {} is not unpacked", version),
            ));
        }
        Ok(payload)
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            Error::tool("install copy", ToolError::Failed(format!("walking {}: {}", src.display(), e)))
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let to = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&to).map_err(|e| Error::io(&to, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
            symlink(&link, &to)?;
        } else {
            fs::copy(entry.path(), &to).map_err(|e| Error::io(&to, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, to: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, to).map_err(|e| Error::io(to, e))
}

#[cfg(not(unix))]
fn symlink(_link: &Path, to: &Path) -> Result<()> {
    Err(Error::io(
        to,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks not supported"),
    ))
}
