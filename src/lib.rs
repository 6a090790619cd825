//! Pupistry - content-addressed configuration artifacts
//!
//! This crate builds a configuration tree into an archive whose content hash
//! is its version, signs and publishes it to an object store, and installs
//! fetched versions onto target machines only after their signature checks
//! out.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod tools;
pub mod version;

pub use cache::Cache;
pub use config::{Config, ConfigError, Mode};
pub use error::{Error, ErrorClass, Result, SecurityViolation};
pub use lifecycle::{
    ApplyOutcome, ArtifactFetcher, BuildOutcome, Builder, Installer, PublishOutcome, Publisher,
    ReadBack,
};
pub use manifest::{Manifest, Signature, SignatureState};
pub use version::{VersionId, VersionSelector};
