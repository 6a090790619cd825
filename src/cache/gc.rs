//! Cache retention and cleanup
//!
//! - Every `unpacked.*` scratch directory is removed
//! - Versions beyond the newest `keep` (by manifest timestamp) lose their
//!   manifest and blob
//! - The version named by the latest pointer is never removed
//! - Leftover temporary archives from interrupted builds are removed

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::Cache;
use crate::error::Result;
use crate::version::VersionId;

/// Retention policy for cached versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of versions to keep besides the latest one
    pub keep: usize,
    /// Report only, delete nothing
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn keep_last_n(keep: usize) -> Self {
        Self { keep, dry_run: false }
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Versions found in the cache
    pub scanned: usize,
    /// Versions whose manifest and blob were (or would be) removed
    pub removed_versions: Vec<VersionId>,
    /// Scratch directories removed
    pub removed_scratch: usize,
    pub bytes_reclaimed: u64,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
}

struct VersionInfo {
    version: VersionId,
    created_at: DateTime<Utc>,
    files: Vec<PathBuf>,
}

/// Cache garbage collector.
pub struct CacheGc<'a> {
    cache: &'a Cache,
    policy: RetentionPolicy,
}

impl<'a> CacheGc<'a> {
    pub fn new(cache: &'a Cache, policy: RetentionPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn run(&self) -> Result<GcResult> {
        let mut result = GcResult::default();
        let latest = self.cache.latest()?;

        for dir in self.cache.unpacked_dirs()? {
            let size = path_size(&dir);
            if self.remove(&dir, &mut result) {
                result.removed_scratch += 1;
                result.bytes_reclaimed += size;
            }
        }

        let temp = self.cache.temp_archive_path();
        for stale in [temp.clone(), temp.with_extension("tar.gz")] {
            if stale.exists() {
                let size = path_size(&stale);
                if self.remove(&stale, &mut result) {
                    result.bytes_reclaimed += size;
                }
            }
        }

        let mut versions = self.collect_versions()?;
        result.scanned = versions.len();

        // Newest first
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut kept = 0;
        for info in versions {
            if latest.as_ref() == Some(&info.version) {
                continue;
            }
            if kept < self.policy.keep {
                kept += 1;
                continue;
            }

            let size: u64 = info.files.iter().map(|f| path_size(f)).sum();
            let mut removed_all = true;
            for file in &info.files {
                removed_all &= self.remove(file, &mut result);
            }
            if removed_all {
                result.bytes_reclaimed += size;
                result.removed_versions.push(info.version);
            }
        }

        info!(
            "cache cleanup: {} versions scanned, {} removed, {} scratch dirs, {} bytes{}",
            result.scanned,
            result.removed_versions.len(),
            result.removed_scratch,
            result.bytes_reclaimed,
            if self.policy.dry_run { " (dry run)" } else { "" }
        );
        Ok(result)
    }

    fn collect_versions(&self) -> Result<Vec<VersionInfo>> {
        let mut infos = Vec::new();
        for version in self.cache.versions()? {
            let manifest_path = self.cache.manifest_path(&version);
            // Unreadable manifests fall back to file mtime
            let created_at = match self.cache.read_manifest(&version) {
                Ok(manifest) => manifest.created_at,
                Err(_) => fs::metadata(&manifest_path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
            };

            let mut files = vec![manifest_path];
            let artifact = self.cache.artifact_path(&version);
            if artifact.exists() {
                files.push(artifact);
            }
            infos.push(VersionInfo {
                version,
                created_at,
                files,
            });
        }
        Ok(infos)
    }

    /// Remove a file or directory; returns whether it is (or would be) gone.
    fn remove(&self, path: &Path, result: &mut GcResult) -> bool {
        if self.policy.dry_run {
            info!("dry run: would remove {}", path.display());
            return true;
        }
        let outcome = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to remove {}: {}", path.display(), e);
                result.errors.push(format!("failed to remove {}: {}", path.display(), e));
                false
            }
        }
    }
}

fn path_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use chrono::Duration;
    use tempfile::TempDir;

    fn version(n: u8) -> VersionId {
        VersionId::parse(&format!("{:032x}", n)).unwrap()
    }

    /// Adds versions 1..=count, each one hour newer than the last
    fn populate(cache: &Cache, count: u8) {
        let base = Utc::now() - Duration::hours(100);
        for n in 1..=count {
            let mut manifest = Manifest::new(version(n), "test@host");
            manifest.created_at = base + Duration::hours(n as i64);
            cache.write_manifest(&manifest).unwrap();
            cache.write_artifact_bytes(&version(n), &[n; 64]).unwrap();
        }
    }

    #[test]
    fn test_keeps_newest_and_latest() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        populate(&cache, 5);
        cache.point_latest(&version(1)).unwrap();

        let result = CacheGc::new(&cache, RetentionPolicy::keep_last_n(2)).run().unwrap();

        assert_eq!(result.scanned, 5);
        let mut removed = result.removed_versions.clone();
        removed.sort();
        assert_eq!(removed, vec![version(2), version(3)]);
        assert!(cache.has_version(&version(1)));
        assert!(cache.has_version(&version(4)));
        assert!(cache.has_version(&version(5)));
        assert!(!cache.artifact_path(&version(2)).exists());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_removes_all_scratch_dirs() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        populate(&cache, 1);
        let scratch = cache.unpacked_dir(&version(1));
        fs::create_dir_all(scratch.join("puppetcode")).unwrap();
        fs::write(scratch.join("puppetcode/site.pp"), "node default {}").unwrap();
        fs::write(cache.temp_archive_path(), b"partial").unwrap();

        let result = CacheGc::new(&cache, RetentionPolicy::keep_last_n(5)).run().unwrap();

        assert_eq!(result.removed_scratch, 1);
        assert!(!scratch.exists());
        assert!(!cache.temp_archive_path().exists());
        assert!(result.removed_versions.is_empty());
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        populate(&cache, 3);
        fs::create_dir_all(cache.unpacked_dir(&version(2))).unwrap();

        let policy = RetentionPolicy::keep_last_n(0).with_dry_run();
        let result = CacheGc::new(&cache, policy).run().unwrap();

        assert_eq!(result.removed_versions.len(), 3);
        assert_eq!(result.removed_scratch, 1);
        for n in 1..=3 {
            assert!(cache.has_version(&version(n)));
        }
        assert!(cache.unpacked_dir(&version(2)).exists());
    }
}
