//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Errors from object-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("store client `{program}` could not be started: {source}")]
    ClientUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("store client failed on {operation} {target}: {stderr}")]
    ClientFailed {
        operation: &'static str,
        target: String,
        stderr: String,
    },

    #[error("access denied on {target}")]
    AccessDenied { target: String },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
