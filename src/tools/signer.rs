//! Ed25519 signing and verification of artifact blobs
//!
//! - The signed message is the SHA-256 digest of the compressed blob
//! - Signatures are stored base64-encoded in the manifest, alongside the
//!   algorithm name and the SHA-256 fingerprint of the public key
//! - Agents construct a verify-only signer from the public key alone

use ed25519_dalek::{Signature as Ed25519Signature, SigningKey, Verifier, VerifyingKey};
use ed25519_dalek::Signer as _;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::manifest::Signature;
use crate::version::VersionId;

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// File names written by [`Ed25519Signer::write_keypair`]
const PRIVATE_KEY_FILE: &str = "signing.key";
const PUBLIC_KEY_FILE: &str = "signing.pub";

/// Errors from signing/verification operations
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("no private key loaded; this signer can only verify")]
    NoSigningKey,

    #[error("private key does not match public key (fingerprint {expected}, got {actual})")]
    KeyMismatch { expected: String, actual: String },
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SigningError + '_ {
    move |source| SigningError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Signing collaborator.
pub trait Signer {
    /// Produce a detached signature over `blob`.
    fn sign(&self, blob: &Path, version: &VersionId) -> SigningResult<Signature>;

    /// Check `signature` against `blob`; `Ok(false)` means invalid.
    fn verify(&self, blob: &Path, signature: &Signature) -> SigningResult<bool>;
}

/// In-process Ed25519 signer.
pub struct Ed25519Signer {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("can_sign", &self.signing_key.is_some())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Ed25519Signer {
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }

    pub fn verify_only(verifying_key: VerifyingKey) -> Self {
        Self {
            signing_key: None,
            verifying_key,
        }
    }

    /// Load keys from base64 key files.
    ///
    /// When both are given the private key must belong to the public key.
    pub fn from_key_files(private_key: Option<&Path>, public_key: &Path) -> SigningResult<Self> {
        let verifying_key = decode_verifying_key(&read_key_file(public_key)?)?;
        let Some(private_key) = private_key else {
            return Ok(Self::verify_only(verifying_key));
        };

        let signing_key = decode_signing_key(&read_key_file(private_key)?)?;
        let expected = compute_key_fingerprint(&verifying_key);
        let actual = compute_key_fingerprint(&signing_key.verifying_key());
        if expected != actual {
            return Err(SigningError::KeyMismatch { expected, actual });
        }
        Ok(Self::new(signing_key))
    }

    pub fn fingerprint(&self) -> String {
        compute_key_fingerprint(&self.verifying_key)
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Generate a fresh key pair and write it under `dir`.
    ///
    /// The private key file is created with mode 0600. Existing files are
    /// never overwritten. Returns `(private, public)` paths.
    pub fn write_keypair(dir: &Path) -> SigningResult<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        let key = generate_keypair();
        write_new_file(&private_path, encode_signing_key(&key).as_bytes(), 0o600)?;
        write_new_file(
            &public_path,
            encode_verifying_key(&key.verifying_key()).as_bytes(),
            0o644,
        )?;
        Ok((private_path, public_path))
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, blob: &Path, version: &VersionId) -> SigningResult<Signature> {
        let signing_key = self.signing_key.as_ref().ok_or(SigningError::NoSigningKey)?;
        let digest = blob_digest(blob)?;
        let signature = signing_key.sign(&digest);
        debug!("signed {} with key {}", version.short(), &self.fingerprint()[..16]);

        Ok(Signature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            value: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            key_fingerprint: self.fingerprint(),
        })
    }

    fn verify(&self, blob: &Path, signature: &Signature) -> SigningResult<bool> {
        if signature.algorithm != SIGNATURE_ALGORITHM {
            debug!("unsupported signature algorithm {}", signature.algorithm);
            return Ok(false);
        }
        if signature.key_fingerprint != self.fingerprint() {
            debug!("signature made with unknown key {}", signature.key_fingerprint);
            return Ok(false);
        }

        let sig_bytes = match base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &signature.value,
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("signature is not valid base64: {}", e);
                return Ok(false);
            }
        };
        let Ok(parsed) = Ed25519Signature::from_slice(&sig_bytes) else {
            return Ok(false);
        };

        let digest = blob_digest(blob)?;
        Ok(self.verifying_key.verify(&digest, &parsed).is_ok())
    }
}

fn blob_digest(blob: &Path) -> SigningResult<[u8; 32]> {
    let mut file = File::open(blob).map_err(io_error(blob))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_error(blob))?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

fn read_key_file(path: &Path) -> SigningResult<String> {
    Ok(fs::read_to_string(path).map_err(io_error(path))?.trim().to_string())
}

fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> SigningResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(io_error(path))?;
    file.write_all(contents).map_err(io_error(path))?;
    file.write_all(b"\n").map_err(io_error(path))?;
    Ok(())
}

/// Compute SHA-256 fingerprint of an Ed25519 public key
pub fn compute_key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Encode a signing key to base64 for storage
pub fn encode_signing_key(key: &SigningKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.to_bytes())
}

/// Decode a signing key from base64
pub fn decode_signing_key(encoded: &str) -> SigningResult<SigningKey> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes_array))
}

/// Encode a verifying key to base64 for storage
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.as_bytes())
}

/// Decode a verifying key from base64
pub fn decode_verifying_key(encoded: &str) -> SigningResult<VerifyingKey> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes_array).map_err(|e| SigningError::InvalidKey(e.to_string()))
}
