//! Artifact lifecycle
//!
//! A version moves through these states:
//!
//! ```text
//! built (local) -> published (store) -> fetched (cache) -> unpacked -> verified -> installed
//! ```
//!
//! Each orchestrator borrows the configuration, the cache and the
//! collaborators it needs; none of them touch process state or exit.

mod build;
mod fetch;
mod install;
mod publish;

pub use build::{BuildOutcome, Builder};
pub use fetch::ArtifactFetcher;
pub use install::{ApplyOutcome, Installer, INSTALL_RECORD};
pub use publish::{PublishOutcome, Publisher, ReadBack};
