//! External collaborators
//!
//! The lifecycle core talks to the source fetch tool, the archiver, the
//! signer and the secrets subsystem only through the traits defined here.
//! Default implementations are provided alongside each trait.

mod archive;
mod exclude;
mod fetcher;
mod secrets;
mod signer;

pub use archive::{Archiver, TarArchiver};
pub use exclude::{ExcludeError, ExcludeRules};
pub use fetcher::{CommandFetcher, FetchDescriptor, SourceFetcher, SourceSpec};
pub use secrets::{CommandSecrets, Secrets};
pub use signer::{
    compute_key_fingerprint, decode_signing_key, decode_verifying_key, encode_signing_key,
    encode_verifying_key, generate_keypair, Ed25519Signer, Signer, SigningError,
    SIGNATURE_ALGORITHM,
};

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

/// Errors from collaborator invocations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("`{program}` could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("exclusion rules: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("signing: {0}")]
    Signing(#[from] SigningError),

    #[error("{0}")]
    Failed(String),
}

/// Run `command` (program plus leading args) with `extra` args appended.
///
/// Stdout is discarded; stderr is captured for the error message.
pub(crate) fn run_command(
    command: &[String],
    extra: &[&OsStr],
    cwd: Option<&Path>,
) -> Result<(), ToolError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ToolError::Failed("empty command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!("running {} {:?} {:?}", program, args, extra);
    let output = cmd.output().map_err(|e| ToolError::Spawn {
        program: program.clone(),
        source: e,
    })?;

    if output.status.success() {
        return Ok(());
    }

    Err(ToolError::Exited {
        program: program.clone(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_success() {
        run_command(&["true".to_string()], &[], None).unwrap();
    }

    #[test]
    fn test_run_command_failure_captures_stderr() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let err = run_command(&cmd, &[], None).unwrap_err();
        match err {
            ToolError::Exited { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Exited, got {:?}", other),
        }
    }

    #[test]
    fn test_run_command_missing_program() {
        let err = run_command(&["/nonexistent/tool".to_string()], &[], None).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_run_command_empty() {
        assert!(matches!(run_command(&[], &[], None), Err(ToolError::Failed(_))));
    }
}
