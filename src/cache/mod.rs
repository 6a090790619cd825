//! Local artifact cache
//!
//! Layout under the cache root:
//!
//! ```text
//! artifacts/manifest.<version>.yaml
//! artifacts/manifest.latest.yaml      byte copy of one versioned manifest
//! artifacts/artifact.<version>.tar.gz
//! artifacts/artifact.latest.tar.gz    copy of the matching blob
//! artifacts/unpacked.<version>/       scratch, always re-derivable
//! work/                               fetched working tree
//! fetch/                              fetch tool's own cache
//! fetch.yaml                          fetch tool descriptor
//! ```
//!
//! Manifest and artifact file names double as object store keys.

mod gc;

pub use gc::{CacheGc, GcResult, RetentionPolicy};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{write_atomic, Manifest};
use crate::version::{VersionId, LATEST};

/// Store key and file name of the latest pointer
pub const LATEST_MANIFEST_KEY: &str = "manifest.latest.yaml";

const LATEST_ARTIFACT: &str = "artifact.latest.tar.gz";
const TEMP_ARCHIVE: &str = "artifact.temp.tar";
const UNPACKED_PREFIX: &str = "unpacked.";

pub fn manifest_key(version: &VersionId) -> String {
    format!("manifest.{}.yaml", version)
}

pub fn artifact_key(version: &VersionId) -> String {
    format!("artifact.{}.tar.gz", version)
}

/// Handle on a cache root directory.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Open the cache at `root`, creating its directories as needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self { root: root.into() };
        let artifacts = cache.artifacts_dir();
        fs::create_dir_all(&artifacts).map_err(|e| Error::io(&artifacts, e))?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn fetch_cache_dir(&self) -> PathBuf {
        self.root.join("fetch")
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.root.join("fetch.yaml")
    }

    /// Uncompressed archive written during a build, before it has a version.
    pub fn temp_archive_path(&self) -> PathBuf {
        self.artifacts_dir().join(TEMP_ARCHIVE)
    }

    pub fn manifest_path(&self, version: &VersionId) -> PathBuf {
        self.artifacts_dir().join(manifest_key(version))
    }

    pub fn artifact_path(&self, version: &VersionId) -> PathBuf {
        self.artifacts_dir().join(artifact_key(version))
    }

    pub fn latest_manifest_path(&self) -> PathBuf {
        self.artifacts_dir().join(LATEST_MANIFEST_KEY)
    }

    pub fn unpacked_dir(&self, version: &VersionId) -> PathBuf {
        self.artifacts_dir().join(format!("{}{}", UNPACKED_PREFIX, version))
    }

    pub fn has_manifest(&self, version: &VersionId) -> bool {
        self.manifest_path(version).is_file()
    }

    /// Both the manifest and the blob are present.
    pub fn has_version(&self, version: &VersionId) -> bool {
        self.has_manifest(version) && self.artifact_path(version).is_file()
    }

    /// Read the manifest for `version`; it must describe that version.
    pub fn read_manifest(&self, version: &VersionId) -> Result<Manifest> {
        let path = self.manifest_path(version);
        let manifest = Manifest::from_file(&path).map_err(|e| Error::manifest(&path, e))?;
        if manifest.version != *version {
            return Err(Error::consistency(
                path.display().to_string(),
                format!("describes version {}", manifest.version),
            ));
        }
        Ok(manifest)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(&manifest.version);
        manifest
            .write_to_file(&path)
            .map_err(|e| Error::manifest(&path, e))
    }

    /// Write raw manifest bytes for `version` (as downloaded).
    pub fn write_manifest_bytes(&self, version: &VersionId, bytes: &[u8]) -> Result<()> {
        let path = self.manifest_path(version);
        write_atomic(&path, bytes).map_err(|e| Error::io(&path, e))
    }

    /// Move a finished blob into the slot for `version`.
    pub fn store_artifact(&self, blob: &Path, version: &VersionId) -> Result<PathBuf> {
        let dest = self.artifact_path(version);
        fs::rename(blob, &dest).map_err(|e| Error::io(&dest, e))?;
        Ok(dest)
    }

    /// Write raw blob bytes for `version` (as downloaded).
    pub fn write_artifact_bytes(&self, version: &VersionId, bytes: &[u8]) -> Result<()> {
        let path = self.artifact_path(version);
        write_atomic(&path, bytes).map_err(|e| Error::io(&path, e))
    }

    /// Point `latest` at `version`.
    ///
    /// The latest manifest becomes a byte copy of the versioned manifest and
    /// the latest blob a link (or copy) of the versioned blob.
    pub fn point_latest(&self, version: &VersionId) -> Result<()> {
        let manifest_path = self.manifest_path(version);
        let bytes = fs::read(&manifest_path).map_err(|e| Error::io(&manifest_path, e))?;

        let artifact_path = self.artifact_path(version);
        if artifact_path.is_file() {
            let latest_artifact = self.artifacts_dir().join(LATEST_ARTIFACT);
            replace_with_link(&artifact_path, &latest_artifact)
                .map_err(|e| Error::io(&latest_artifact, e))?;
        }

        // Manifest pointer goes last so it never names a missing blob
        let latest = self.latest_manifest_path();
        write_atomic(&latest, &bytes).map_err(|e| Error::io(&latest, e))?;
        debug!("local latest now {}", version);
        Ok(())
    }

    /// Refresh the latest pointer if it currently names `version`.
    pub fn refresh_latest_if(&self, version: &VersionId) -> Result<()> {
        if self.latest()?.as_ref() == Some(version) {
            self.point_latest(version)?;
        }
        Ok(())
    }

    /// Version named by the local latest pointer, if any.
    ///
    /// A pointer holding a malformed identifier is a consistency violation.
    pub fn latest(&self) -> Result<Option<VersionId>> {
        Ok(self.latest_manifest()?.map(|m| m.version))
    }

    pub fn latest_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.latest_manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        Manifest::from_file(&path)
            .map(Some)
            .map_err(|e| Error::manifest(&path, e))
    }

    /// Every version with a manifest in the cache, sorted by identifier.
    pub fn versions(&self) -> Result<Vec<VersionId>> {
        let dir = self.artifacts_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&dir, e)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("manifest."))
                .and_then(|n| n.strip_suffix(".yaml"))
            else {
                continue;
            };
            if id == LATEST {
                continue;
            }
            if let Ok(version) = VersionId::parse(id) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Scratch directories currently present, by version.
    pub fn unpacked_dirs(&self) -> Result<Vec<PathBuf>> {
        let dir = self.artifacts_dir();
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let is_scratch = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(UNPACKED_PREFIX));
            if is_scratch && entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn replace_with_link(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let temp = parent.join(format!(".tmp.link.{}", std::process::id()));
    let _ = fs::remove_file(&temp);
    if fs::hard_link(src, &temp).is_err() {
        fs::copy(src, &temp)?;
    }
    fs::rename(&temp, dest)
}
