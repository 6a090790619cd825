//! Shared fixtures for lifecycle integration tests
//!
//! - `control_repo/`: a small Puppet control repository used as the
//!   fetched source tree
//! - `ControlRepoFetcher`: stands in for the external fetch tool
//! - `Workspace`: build side and agent side sharing one store

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use pupistry::tools::{
    Ed25519Signer, FetchDescriptor, SourceFetcher, ToolError,
};
use pupistry::{Cache, Config};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Path to the control repository fixture
pub fn control_repo_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/control_repo")
}

/// Copies the control repository fixture into every source's `basedir`,
/// replacing what was there, plus any extra files queued with `add_file`.
#[derive(Default)]
pub struct ControlRepoFetcher {
    extra: RefCell<Vec<(String, String)>>,
}

impl ControlRepoFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, rel: &str, contents: &str) {
        self.extra.borrow_mut().push((rel.to_string(), contents.to_string()));
    }
}

impl SourceFetcher for ControlRepoFetcher {
    fn fetch(&self, descriptor: &FetchDescriptor, _descriptor_path: &Path) -> Result<(), ToolError> {
        for source in descriptor.sources.values() {
            if source.basedir.exists() {
                fs::remove_dir_all(&source.basedir)?;
            }
            copy_dir(&control_repo_path(), &source.basedir)?;
            for (rel, contents) in self.extra.borrow().iter() {
                let path = source.basedir.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, contents)?;
            }
        }
        Ok(())
    }
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let to = dest.join(entry.path().strip_prefix(src).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

/// A build host and an agent host sharing one store.
pub struct Workspace {
    pub dir: TempDir,
    pub build_config: Config,
    pub agent_config: Config,
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let (private_key, public_key) = Ed25519Signer::write_keypair(&dir.path().join("keys")).unwrap();

        let mut build_config = Config::default();
        build_config.general.cache_dir = dir.path().join("build-cache");
        build_config.general.builder = Some("ci@build01".to_string());
        build_config.build.source = Some("git@example.com:ops/control.git".to_string());
        build_config.store.bucket = Some("configs".to_string());
        build_config.signing.private_key = Some(private_key.clone());
        build_config.signing.public_key = Some(public_key.clone());

        let mut agent_config = Config::default();
        agent_config.general.cache_dir = dir.path().join("agent-cache");
        agent_config.store.bucket = Some("configs".to_string());
        agent_config.signing.public_key = Some(public_key.clone());
        agent_config.agent.target = Some(dir.path().join("target/environments"));

        Self {
            dir,
            build_config,
            agent_config,
            private_key,
            public_key,
        }
    }

    pub fn build_cache(&self) -> Cache {
        Cache::open(&self.build_config.general.cache_dir).unwrap()
    }

    pub fn agent_cache(&self) -> Cache {
        Cache::open(&self.agent_config.general.cache_dir).unwrap()
    }

    pub fn signer(&self) -> Ed25519Signer {
        Ed25519Signer::from_key_files(Some(&self.private_key), &self.public_key).unwrap()
    }

    pub fn verifier(&self) -> Ed25519Signer {
        Ed25519Signer::from_key_files(None, &self.public_key).unwrap()
    }

    pub fn target(&self) -> PathBuf {
        self.agent_config.agent.target.clone().unwrap()
    }
}
