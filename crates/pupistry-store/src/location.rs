//! Bucket, prefix and credential profiles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where artifacts live: a bucket plus an optional key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl StoreLocation {
    pub fn new(bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix,
        }
    }

    /// Prefix with surrounding slashes removed; `None` when empty.
    pub fn normalized_prefix(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
    }

    /// Object path within the bucket for `key`.
    pub fn object_path(&self, key: &str) -> String {
        match self.normalized_prefix() {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// `s3://bucket/prefix/key` form.
    pub fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_path(key))
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalized_prefix() {
            Some(prefix) => write!(f, "s3://{}/{}/", self.bucket, prefix),
            None => write!(f, "s3://{}/", self.bucket),
        }
    }
}

/// Which credential profile a store handle is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Read/write, used by build and publish.
    Build,
    /// Read-only, used by installers.
    Agent,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Agent => "agent",
        }
    }
}

/// Access credentials for one profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}
