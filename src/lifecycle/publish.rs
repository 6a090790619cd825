//! Publish orchestrator: sign a local version and upload it to the store.

use pupistry_store::ObjectStore;
use tracing::{info, warn};

use super::ArtifactFetcher;
use crate::cache::{artifact_key, manifest_key, Cache, LATEST_MANIFEST_KEY};
use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, SignatureState};
use crate::tools::{Signer, ToolError};
use crate::version::{VersionId, VersionSelector};

/// Outcome of the post-publish read-back through the agent profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadBack {
    /// No agent credentials configured
    Skipped,
    Passed,
    /// The agent profile could not fetch what was just published
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        version: VersionId,
        signed: bool,
        readback: ReadBack,
    },
    /// The store's latest pointer already names this version; nothing uploaded
    AlreadyPublished(VersionId),
}

pub struct Publisher<'a> {
    config: &'a Config,
    cache: &'a Cache,
    store: &'a dyn ObjectStore,
    signer: Option<&'a dyn Signer>,
    agent_store: Option<&'a dyn ObjectStore>,
}

impl<'a> Publisher<'a> {
    pub fn new(config: &'a Config, cache: &'a Cache, store: &'a dyn ObjectStore) -> Self {
        Self {
            config,
            cache,
            store,
            signer: None,
            agent_store: None,
        }
    }

    pub fn with_signer(mut self, signer: &'a dyn Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Store handle using the read-only agent profile, for read-back.
    pub fn with_agent_store(mut self, store: &'a dyn ObjectStore) -> Self {
        self.agent_store = Some(store);
        self
    }

    pub fn publish(&self, selector: &VersionSelector) -> Result<PublishOutcome> {
        let version = self.resolve(selector)?;

        if self.remote_latest()?.as_ref() == Some(&version) {
            info!("version {} is already the published latest", version);
            return Ok(PublishOutcome::AlreadyPublished(version));
        }

        let manifest_path = self.cache.manifest_path(&version);
        let artifact_path = self.cache.artifact_path(&version);
        for path in [&manifest_path, &artifact_path] {
            if !path.is_file() {
                return Err(Error::consistency(
                    path.display().to_string(),
                    "missing from the cache although the version was built",
                ));
            }
        }

        let mut manifest = self.cache.read_manifest(&version)?;
        let signed = if self.config.signing.enabled {
            self.ensure_signed(&mut manifest)?;
            true
        } else {
            warn!("signing is disabled; publishing {} unsigned", version);
            false
        };

        for (path, key) in [
            (&artifact_path, artifact_key(&version)),
            (&manifest_path, manifest_key(&version)),
            (&manifest_path, LATEST_MANIFEST_KEY.to_string()),
        ] {
            self.store
                .upload(path, &key)
                .map_err(|e| Error::store("upload", key.clone(), e))?;
            info!("uploaded {}", key);
        }

        let readback = self.read_back(&version);
        Ok(PublishOutcome::Published {
            version,
            signed,
            readback,
        })
    }

    fn resolve(&self, selector: &VersionSelector) -> Result<VersionId> {
        match selector {
            VersionSelector::Exact(version) => {
                if !self.cache.has_manifest(version) {
                    return Err(Error::NotFound(format!(
                        "nothing to publish: version {} was not built here",
                        version
                    )));
                }
                Ok(version.clone())
            }
            VersionSelector::Latest => self.cache.latest()?.ok_or_else(|| {
                Error::NotFound("nothing to publish: no local build".to_string())
            }),
        }
    }

    fn remote_latest(&self) -> Result<Option<VersionId>> {
        let Some(bytes) = self
            .store
            .download(LATEST_MANIFEST_KEY)
            .map_err(|e| Error::store("download", LATEST_MANIFEST_KEY, e))?
        else {
            return Ok(None);
        };
        match Manifest::parse_untrusted(&bytes) {
            Ok(manifest) => Ok(Some(manifest.version)),
            Err(e) => {
                // Overwritten by this publish
                warn!("store {} is unreadable ({}); replacing it", LATEST_MANIFEST_KEY, e);
                Ok(None)
            }
        }
    }

    /// Sign `manifest`'s blob unless it already carries a valid signature.
    fn ensure_signed(&self, manifest: &mut Manifest) -> Result<()> {
        let signer = self.signer.ok_or_else(|| ConfigError::Missing {
            key: "signing.private_key".to_string(),
        })?;
        let version = manifest.version.clone();
        let blob = self.cache.artifact_path(&version);

        if let Some(existing) = manifest.signature() {
            let valid = signer
                .verify(&blob, existing)
                .map_err(|e| Error::tool("signature verification", e.into()))?;
            if valid {
                info!("reusing existing signature for {}", version);
                return Ok(());
            }
            warn!("existing signature for {} does not verify; re-signing", version);
        }

        let signature = signer
            .sign(&blob, &version)
            .map_err(|e| Error::tool("signing", e.into()))?;
        let valid = signer
            .verify(&blob, &signature)
            .map_err(|e| Error::tool("signature verification", e.into()))?;
        if !valid {
            return Err(Error::tool(
                "signing",
                ToolError::Failed(format!("fresh signature for {} does not verify", version)),
            ));
        }

        manifest.signature = SignatureState::Signed(signature);
        self.cache.write_manifest(manifest)?;
        self.cache.refresh_latest_if(&version)?;
        info!("signed version {}", version);
        Ok(())
    }

    fn read_back(&self, version: &VersionId) -> ReadBack {
        let Some(agent_store) = self.agent_store else {
            return ReadBack::Skipped;
        };

        let result = tempfile::tempdir()
            .map_err(|e| e.to_string())
            .and_then(|dir| {
                let cache = Cache::open(dir.path()).map_err(|e| e.to_string())?;
                ArtifactFetcher::new(&cache, agent_store)
                    .fetch(&VersionSelector::Exact(version.clone()))
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(_) => {
                info!("agent credentials can read version {}", version);
                ReadBack::Passed
            }
            Err(e) => {
                warn!(
                    "published {}, but the agent profile cannot fetch it: {}",
                    version, e
                );
                ReadBack::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{generate_keypair, Ed25519Signer};
    use pupistry_store::{MemoryStore, StoreOp};
    use std::fs;
    use tempfile::TempDir;

    const V: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";

    fn local_build(cache: &Cache) -> VersionId {
        let version = VersionId::parse(V).unwrap();
        cache.write_artifact_bytes(&version, b"compressed tree").unwrap();
        cache.write_manifest(&Manifest::new(version.clone(), "ci@build01")).unwrap();
        cache.point_latest(&version).unwrap();
        version
    }

    fn unsigned_config() -> Config {
        let mut config = Config::default();
        config.signing.enabled = false;
        config
    }

    #[test]
    fn test_upload_order_and_latest_copy() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        let store = MemoryStore::new();
        let config = unsigned_config();

        let outcome = Publisher::new(&config, &cache, &store)
            .publish(&VersionSelector::Latest)
            .unwrap();

        assert_eq!(
            outcome,
            PublishOutcome::Published {
                version: version.clone(),
                signed: false,
                readback: ReadBack::Skipped,
            }
        );
        assert_eq!(
            store.uploads(),
            vec![
                artifact_key(&version),
                manifest_key(&version),
                LATEST_MANIFEST_KEY.to_string()
            ]
        );
        assert_eq!(store.get(LATEST_MANIFEST_KEY), store.get(&manifest_key(&version)));
    }

    #[test]
    fn test_second_publish_uploads_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        let store = MemoryStore::new();
        let config = unsigned_config();
        let publisher = Publisher::new(&config, &cache, &store);

        publisher.publish(&VersionSelector::Latest).unwrap();
        store.clear_ops();
        let outcome = publisher.publish(&VersionSelector::Latest).unwrap();

        assert_eq!(outcome, PublishOutcome::AlreadyPublished(version));
        assert!(store.uploads().is_empty());
        assert_eq!(store.ops(), vec![StoreOp::Download(LATEST_MANIFEST_KEY.to_string())]);
    }

    #[test]
    fn test_signing_persists_and_refreshes_latest() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        let store = MemoryStore::new();
        let config = Config::default();
        let signer = Ed25519Signer::new(generate_keypair());

        let outcome = Publisher::new(&config, &cache, &store)
            .with_signer(&signer)
            .publish(&VersionSelector::Latest)
            .unwrap();

        assert!(matches!(outcome, PublishOutcome::Published { signed: true, .. }));
        let manifest = cache.read_manifest(&version).unwrap();
        let signature = manifest.signature().unwrap();
        assert!(signer.verify(&cache.artifact_path(&version), signature).unwrap());
        assert_eq!(
            fs::read(cache.latest_manifest_path()).unwrap(),
            fs::read(cache.manifest_path(&version)).unwrap()
        );
        let remote = Manifest::parse_untrusted(&store.get(LATEST_MANIFEST_KEY).unwrap()).unwrap();
        assert!(remote.is_signed());
    }

    #[test]
    fn test_existing_valid_signature_is_reused() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        let config = Config::default();
        let signer = Ed25519Signer::new(generate_keypair());

        // First attempt fails at upload time
        let broken = MemoryStore::new().read_only_view();
        let publisher = Publisher::new(&config, &cache, &broken).with_signer(&signer);
        assert!(publisher.publish(&VersionSelector::Latest).is_err());
        let first = fs::read(cache.manifest_path(&version)).unwrap();

        let store = MemoryStore::new();
        Publisher::new(&config, &cache, &store)
            .with_signer(&signer)
            .publish(&VersionSelector::Latest)
            .unwrap();
        assert_eq!(fs::read(cache.manifest_path(&version)).unwrap(), first);
    }

    #[test]
    fn test_signing_enabled_without_signer_is_config_error() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        local_build(&cache);
        let store = MemoryStore::new();
        let config = Config::default();

        let err = Publisher::new(&config, &cache, &store)
            .publish(&VersionSelector::Latest)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(store.uploads().is_empty());
    }

    #[test]
    fn test_nothing_to_publish() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let store = MemoryStore::new();
        let config = unsigned_config();

        let err = Publisher::new(&config, &cache, &store)
            .publish(&VersionSelector::Latest)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_missing_blob_is_consistency_error() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        fs::remove_file(cache.artifact_path(&version)).unwrap();
        let store = MemoryStore::new();
        let config = unsigned_config();

        let err = Publisher::new(&config, &cache, &store)
            .publish(&VersionSelector::Latest)
            .unwrap_err();
        assert!(matches!(err, Error::Consistency { .. }));
        assert!(store.uploads().is_empty());
    }

    #[test]
    fn test_readback_failure_does_not_fail_publish() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let version = local_build(&cache);
        let store = MemoryStore::new();
        // Agent view is a snapshot taken before publishing, so it sees nothing
        let agent = store.read_only_view();
        let config = unsigned_config();

        let outcome = Publisher::new(&config, &cache, &store)
            .with_agent_store(&agent)
            .publish(&VersionSelector::Exact(version))
            .unwrap();

        match outcome {
            PublishOutcome::Published { readback: ReadBack::Failed(msg), .. } => {
                assert!(msg.contains("not found"));
            }
            other => panic!("expected failed read-back, got {:?}", other),
        }
    }
}
