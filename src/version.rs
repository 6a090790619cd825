//! Content addressing
//!
//! A version identifier is the hex-encoded first 16 bytes of the SHA-256
//! digest of the uncompressed archive. Identical archive bytes always give
//! the same identifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

/// Length of a version identifier in hex characters.
pub const VERSION_HEX_LEN: usize = 32;

/// Token accepted on the command line and used in cache/store keys.
pub const LATEST: &str = "latest";

fn version_pattern() -> &'static regex_lite::Regex {
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"^[0-9a-f]{32}$").expect("version pattern is valid")
    })
}

/// Errors from parsing a version identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("{0:?} is not a 32-character lowercase hex identifier")]
    Malformed(String),

    #[error("\"latest\" is a pointer, not a version identifier")]
    LatestToken,
}

/// A validated content-hash version identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Validate `value` against the fixed-length hex format.
    pub fn parse(value: &str) -> Result<Self, VersionError> {
        if value == LATEST {
            return Err(VersionError::LatestToken);
        }
        if !version_pattern().is_match(value) {
            return Err(VersionError::Malformed(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(&digest[..VERSION_HEX_LEN / 2]))
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", self.0)
    }
}

impl FromStr for VersionId {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionId {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.0
    }
}

impl AsRef<str> for VersionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which version a command should act on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Follow the `latest` pointer.
    #[default]
    Latest,
    Exact(VersionId),
}

impl VersionSelector {
    /// Interpret an optional command-line argument.
    pub fn from_arg(arg: Option<&str>) -> Result<Self, VersionError> {
        match arg {
            None | Some(LATEST) => Ok(Self::Latest),
            Some(value) => VersionId::parse(value).map(Self::Exact),
        }
    }
}

/// Version identifier of in-memory archive bytes.
pub fn content_hash(bytes: &[u8]) -> VersionId {
    VersionId::from_digest(&Sha256::digest(bytes))
}

/// Version identifier of everything readable from `reader`.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<VersionId> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(VersionId::from_digest(&hasher.finalize()))
}

/// Reader adapter that hashes everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Drain whatever is left and return the version identifier of all bytes read.
    pub fn finish(mut self) -> io::Result<VersionId> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(VersionId::from_digest(&self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Version identifier of an uncompressed archive on disk.
pub fn hash_file(path: &Path) -> io::Result<VersionId> {
    hash_reader(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(b"archive bytes");
        let b = content_hash(b"archive bytes");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), VERSION_HEX_LEN);
        assert_ne!(a, content_hash(b"other bytes"));
    }

    #[test]
    fn test_hash_reader_matches_content_hash() {
        let data = vec![7u8; 200_000];
        assert_eq!(hash_reader(&data[..]).unwrap(), content_hash(&data));
    }

    #[test]
    fn test_hashing_reader_drains_remainder() {
        let data = b"header....trailing padding";
        let mut reader = HashingReader::new(&data[..]);
        let mut first = [0u8; 6];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(reader.finish().unwrap(), content_hash(data));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(VersionId::parse("a1b2c3d4e5f60718293a4b5c6d7e8f90").is_ok());
        assert!(matches!(
            VersionId::parse("../../etc/passwd"),
            Err(VersionError::Malformed(_))
        ));
        assert!(VersionId::parse("A1B2C3D4E5F60718293A4B5C6D7E8F90").is_err());
        assert!(VersionId::parse("a1b2c3").is_err());
        assert!(VersionId::parse("a1b2c3d4e5f60718293a4b5c6d7e8f9000").is_err());
        assert_eq!(VersionId::parse("latest"), Err(VersionError::LatestToken));
    }

    #[test]
    fn test_serde_validates() {
        let ok: Result<VersionId, _> = serde_yaml::from_str("a1b2c3d4e5f60718293a4b5c6d7e8f90");
        assert!(ok.is_ok());
        let bad: Result<VersionId, _> = serde_yaml::from_str("\"../x\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_selector_from_arg() {
        assert_eq!(VersionSelector::from_arg(None).unwrap(), VersionSelector::Latest);
        assert_eq!(VersionSelector::from_arg(Some("latest")).unwrap(), VersionSelector::Latest);
        assert!(matches!(
            VersionSelector::from_arg(Some("a1b2c3d4e5f60718293a4b5c6d7e8f90")).unwrap(),
            VersionSelector::Exact(_)
        ));
        assert!(VersionSelector::from_arg(Some("nope")).is_err());
    }
}
