//! Source-tree fetch tool seam.
//!
//! The build writes a descriptor file telling the fetch tool where its own
//! cache lives and which upstream source to materialise into which
//! directory, then hands the descriptor path to the tool.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{run_command, ToolError};
use crate::manifest::write_atomic;

/// Name of the single source entry written into descriptors
const SOURCE_NAME: &str = "puppet";

/// One upstream source and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub remote: String,
    pub basedir: PathBuf,
}

/// Descriptor consumed by the fetch tool (`fetch.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDescriptor {
    pub cachedir: PathBuf,
    pub sources: BTreeMap<String, SourceSpec>,
}

impl FetchDescriptor {
    pub fn new(cachedir: impl Into<PathBuf>, remote: impl Into<String>, basedir: impl Into<PathBuf>) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(
            SOURCE_NAME.to_string(),
            SourceSpec {
                remote: remote.into(),
                basedir: basedir.into(),
            },
        );
        Self { cachedir: cachedir.into(), sources }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), ToolError> {
        let yaml = self
            .to_yaml()
            .map_err(|e| ToolError::Failed(format!("serializing fetch descriptor: {}", e)))?;
        write_atomic(path, yaml.as_bytes())?;
        Ok(())
    }
}

/// Source fetch collaborator.
pub trait SourceFetcher {
    /// Populate every `basedir` in `descriptor`, which has been written to
    /// `descriptor_path`.
    fn fetch(&self, descriptor: &FetchDescriptor, descriptor_path: &Path) -> Result<(), ToolError>;
}

/// Runs an external fetch program with the descriptor path appended.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    command: Vec<String>,
}

impl CommandFetcher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl SourceFetcher for CommandFetcher {
    fn fetch(&self, descriptor: &FetchDescriptor, descriptor_path: &Path) -> Result<(), ToolError> {
        for (name, source) in &descriptor.sources {
            info!("fetching source {} from {}", name, source.remote);
        }
        run_command(&self.command, &[descriptor_path.as_os_str()], Some(&descriptor.cachedir))
    }
}
