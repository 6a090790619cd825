//! Exclusion rules for archiving the working tree
//!
//! Version-control metadata is always excluded. What else is left out
//! depends on whether the secrets subsystem is enabled:
//! - disabled: its stale `encrypted` output directory
//! - enabled: the raw secrets directory and the subsystem's node list

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::config::SecretsConfig;

/// Patterns excluded from every archive
const VCS_EXCLUDES: &[&str] = &["**/.git", "**/.git/**", "**/.svn", "**/.svn/**", "**/.hg", "**/.hg/**"];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("glob pattern error: {0}")]
    GlobError(#[from] globset::Error),
}

/// Exclusion rules for filtering archive entries
#[derive(Debug)]
pub struct ExcludeRules {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeRules {
    /// Rules from an explicit pattern list (VCS metadata is always added).
    pub fn new(patterns: &[String]) -> Result<Self, ExcludeError> {
        let mut all: Vec<String> = VCS_EXCLUDES.iter().map(|p| p.to_string()).collect();
        all.extend(patterns.iter().filter(|p| !p.is_empty()).cloned());

        let mut builder = GlobSetBuilder::new();
        for pattern in &all {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            glob_set: builder.build()?,
            patterns: all,
        })
    }

    /// Rules for a build, given the secrets layout, whether the subsystem is
    /// active, and extra user globs.
    pub fn for_build(
        secrets: &SecretsConfig,
        secrets_enabled: bool,
        extra: &[String],
    ) -> Result<Self, ExcludeError> {
        let mut patterns = Vec::new();
        let mut exclude_dir = |dir: String| {
            patterns.push(format!("**/{}", dir));
            patterns.push(format!("**/{}/**", dir));
        };

        if secrets_enabled {
            exclude_dir(secrets.raw_dir.clone());
            exclude_dir(format!("{}/nodes", secrets.subtree));
        } else {
            exclude_dir(format!("{}/encrypted", secrets.subtree));
        }

        patterns.extend(extra.iter().cloned());
        Self::new(&patterns)
    }

    /// Check if a path (relative to the archive root) should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.glob_set.is_match(path_str.as_ref())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
