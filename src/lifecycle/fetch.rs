//! Fetch orchestrator: resolve a remote version and cache it locally.

use pupistry_store::ObjectStore;
use tracing::{debug, info};

use crate::cache::{artifact_key, manifest_key, Cache, LATEST_MANIFEST_KEY};
use crate::error::{Error, Result, SecurityViolation};
use crate::manifest::{Manifest, ManifestError};
use crate::version::{VersionId, VersionSelector};

pub struct ArtifactFetcher<'a> {
    cache: &'a Cache,
    store: &'a dyn ObjectStore,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(cache: &'a Cache, store: &'a dyn ObjectStore) -> Self {
        Self { cache, store }
    }

    /// Version named by the store's latest pointer.
    ///
    /// A pointer holding anything but a well-formed identifier is treated as
    /// tampering and fails before any download.
    pub fn remote_latest(&self) -> Result<Option<VersionId>> {
        let Some(bytes) = self.download(LATEST_MANIFEST_KEY)? else {
            return Ok(None);
        };
        let manifest = parse_remote(LATEST_MANIFEST_KEY, &bytes)?;
        Ok(Some(manifest.version))
    }

    /// Resolve `selector` to a concrete version.
    pub fn resolve(&self, selector: &VersionSelector) -> Result<VersionId> {
        match selector {
            VersionSelector::Exact(version) => Ok(version.clone()),
            VersionSelector::Latest => self.remote_latest()?.ok_or_else(|| {
                Error::NotFound(format!(
                    "no published version: {} has no {}",
                    self.store.describe(),
                    LATEST_MANIFEST_KEY
                ))
            }),
        }
    }

    /// Make `selector`'s version available in the cache.
    ///
    /// Nothing is downloaded when the cache already holds the manifest and
    /// blob. The blob is written before the manifest, so an interrupted fetch
    /// never leaves a version that looks complete. Fetching `latest` also
    /// moves the local latest pointer.
    pub fn fetch(&self, selector: &VersionSelector) -> Result<VersionId> {
        let version = self.resolve(selector)?;

        if self.cache.has_version(&version) {
            debug!("version {} already cached", version);
        } else {
            let key = manifest_key(&version);
            let manifest_bytes = self.download(&key)?.ok_or_else(|| self.not_found(&key))?;
            let manifest = parse_remote(&key, &manifest_bytes)?;
            if manifest.version != version {
                return Err(SecurityViolation::ManifestMismatch {
                    origin: key,
                    expected: version.to_string(),
                    found: manifest.version.to_string(),
                }
                .into());
            }

            let key = artifact_key(&version);
            let blob = self.download(&key)?.ok_or_else(|| self.not_found(&key))?;

            self.cache.write_artifact_bytes(&version, &blob)?;
            self.cache.write_manifest_bytes(&version, &manifest_bytes)?;
            info!("fetched version {} ({} bytes)", version, blob.len());
        }

        if *selector == VersionSelector::Latest && self.cache.latest()?.as_ref() != Some(&version) {
            self.cache.point_latest(&version)?;
        }
        Ok(version)
    }

    fn download(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store
            .download(key)
            .map_err(|e| Error::store("download", key, e))
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound(format!("{} not found in {}", key, self.store.describe()))
    }
}

/// Parse manifest bytes downloaded from `key`.
fn parse_remote(key: &str, bytes: &[u8]) -> Result<Manifest> {
    Manifest::parse_untrusted(bytes).map_err(|e| match e {
        ManifestError::MalformedVersion(value) => SecurityViolation::MalformedVersion {
            origin: format!("store object {}", key),
            value,
        }
        .into(),
        ManifestError::MissingVersion => SecurityViolation::MalformedVersion {
            origin: format!("store object {}", key),
            value: String::new(),
        }
        .into(),
        other => Error::consistency(format!("store object {}", key), other.to_string()),
    })
}
