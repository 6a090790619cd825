//! Pupistry object store
//!
//! Put/get/list access to artifacts and manifests kept under a bucket and
//! key prefix. Keys are flat file names such as `manifest.latest.yaml`;
//! the location decides where they physically land.

pub mod aws_cli;
pub mod directory;
pub mod error;
pub mod location;
pub mod memory;

use std::path::Path;

pub use aws_cli::AwsCliStore;
pub use directory::DirectoryStore;
pub use error::StoreError;
pub use location::{Credentials, Profile, StoreLocation};
pub use memory::{MemoryStore, StoreOp};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A remote (or remote-like) key/value store for artifact files.
///
/// Implementations do not retry; transport failures are reported as-is.
pub trait ObjectStore {
    /// Upload a local file under `key`, replacing any previous object.
    fn upload(&self, local_path: &Path, key: &str) -> StoreResult<()>;

    /// Download the object stored under `key`.
    ///
    /// Returns `Ok(None)` when the object does not exist.
    fn download(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List the keys present under the configured prefix.
    fn list(&self) -> StoreResult<Vec<String>>;

    /// Human-readable location, used in log and error messages.
    fn describe(&self) -> String;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Box<T> {
    fn upload(&self, local_path: &Path, key: &str) -> StoreResult<()> {
        (**self).upload(local_path, key)
    }

    fn download(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).download(key)
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        (**self).list()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Reject keys that could address anything outside the prefix.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
