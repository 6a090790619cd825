//! Filesystem-backed store.
//!
//! Maps a bucket to a directory: `<root>/<bucket>/<prefix>/<key>`. Useful for
//! shared mounts (NFS, CIFS) and for local testing of the full lifecycle.
//! Uploads are atomic via write-to-temp-then-rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::location::StoreLocation;
use crate::{validate_key, ObjectStore, StoreError, StoreResult};

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    location: StoreLocation,
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>, location: StoreLocation) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            location,
        }
    }

    /// Directory holding the objects for the configured prefix.
    pub fn object_dir(&self) -> PathBuf {
        let mut dir = self.root.join(&self.location.bucket);
        if let Some(prefix) = self.location.normalized_prefix() {
            dir = dir.join(prefix);
        }
        dir
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.object_dir().join(key)
    }
}

impl ObjectStore for DirectoryStore {
    fn upload(&self, local_path: &Path, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        let dir = self.object_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(dir.display().to_string(), e))?;

        let temp_name = format!(
            ".tmp.{}.{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        let temp_path = dir.join(temp_name);
        let final_path = self.object_path(key);

        if let Err(e) = fs::copy(local_path, &temp_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(local_path.display().to_string(), e));
        }
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(final_path.display().to_string(), e));
        }

        debug!("uploaded {} -> {}", local_path.display(), final_path.display());
        Ok(())
    }

    fn download(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.object_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(StoreError::AccessDenied {
                    target: path.display().to_string(),
                })
            }
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let dir = self.object_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir.display().to_string(), e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir.display().to_string(), e))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(".tmp.") {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("{} (dir {})", self.location, self.object_dir().display())
    }
}
