//! Build orchestrator: fetch sources, archive, content-address, store.

use std::fs;

use tracing::{debug, info};

use crate::cache::Cache;
use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::tools::{Archiver, ExcludeRules, FetchDescriptor, Secrets, SourceFetcher};
use crate::version::{hash_file, VersionId};

/// Result of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A new version was written to the cache and made latest
    Built(VersionId),
    /// The tree hashed to a version already in the cache; nothing written
    Unchanged(VersionId),
}

impl BuildOutcome {
    pub fn version(&self) -> &VersionId {
        match self {
            Self::Built(v) | Self::Unchanged(v) => v,
        }
    }
}

pub struct Builder<'a> {
    config: &'a Config,
    cache: &'a Cache,
    fetcher: &'a dyn SourceFetcher,
    archiver: &'a dyn Archiver,
    secrets: &'a dyn Secrets,
}

impl<'a> Builder<'a> {
    pub fn new(
        config: &'a Config,
        cache: &'a Cache,
        fetcher: &'a dyn SourceFetcher,
        archiver: &'a dyn Archiver,
        secrets: &'a dyn Secrets,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            archiver,
            secrets,
        }
    }

    pub fn build(&self) -> Result<BuildOutcome> {
        let source = self
            .config
            .build
            .source
            .as_deref()
            .ok_or_else(|| ConfigError::Missing {
                key: "build.source".to_string(),
            })?;

        let work = self.cache.work_dir();
        let payload = work.join(&self.config.general.payload_dir);
        let fetch_cache = self.cache.fetch_cache_dir();
        for dir in [&work, &fetch_cache] {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let descriptor = FetchDescriptor::new(&fetch_cache, source, &payload);
        let descriptor_path = self.cache.descriptor_path();
        descriptor
            .write_to_file(&descriptor_path)
            .map_err(|e| Error::tool("fetch descriptor", e))?;
        self.fetcher
            .fetch(&descriptor, &descriptor_path)
            .map_err(|e| Error::tool("source fetch", e))?;

        let secrets_enabled = self.secrets.is_enabled();
        if secrets_enabled {
            self.secrets
                .encrypt(&payload)
                .map_err(|e| Error::tool("secrets encryption", e))?;
        }

        let rules = ExcludeRules::for_build(
            &self.config.build.secrets,
            secrets_enabled,
            &self.config.build.exclude,
        )
        .map_err(|e| Error::tool("archive", e.into()))?;
        debug!("exclusions: {:?}", rules.patterns());

        let temp = self.cache.temp_archive_path();
        let _ = fs::remove_file(&temp);
        if let Err(e) = self.archiver.archive(&work, &rules, &temp) {
            let _ = fs::remove_file(&temp);
            return Err(Error::tool("archive", e));
        }

        let version = match hash_file(&temp) {
            Ok(version) => version,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(Error::io(&temp, e));
            }
        };

        if self.cache.has_manifest(&version) {
            fs::remove_file(&temp).map_err(|e| Error::io(&temp, e))?;
            info!("version {} already built, nothing to do", version);
            return Ok(BuildOutcome::Unchanged(version));
        }

        let compressed = match self.archiver.compress(&temp) {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(Error::tool("compression", e));
            }
        };
        self.cache.store_artifact(&compressed, &version)?;

        let manifest = Manifest::new(version.clone(), self.config.builder_identity());
        self.cache.write_manifest(&manifest)?;
        self.cache.point_latest(&version)?;

        info!("built version {}", version);
        Ok(BuildOutcome::Built(version))
    }
}
