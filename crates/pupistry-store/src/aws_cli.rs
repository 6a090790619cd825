//! S3 access through the external `aws` command-line client.
//!
//! Credentials for the selected profile are passed through the client's
//! environment, never on the command line.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::location::{Credentials, Profile, StoreLocation};
use crate::{validate_key, ObjectStore, StoreError, StoreResult};

const DEFAULT_PROGRAM: &str = "aws";

/// Object store backed by `aws s3`.
#[derive(Debug, Clone)]
pub struct AwsCliStore {
    program: String,
    location: StoreLocation,
    profile: Profile,
    credentials: Option<Credentials>,
    endpoint: Option<String>,
}

impl AwsCliStore {
    pub fn new(location: StoreLocation, profile: Profile) -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            location,
            profile,
            credentials: None,
            endpoint: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Custom endpoint for S3-compatible services.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(ref endpoint) = self.endpoint {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        if let Some(ref creds) = self.credentials {
            cmd.env("AWS_ACCESS_KEY_ID", &creds.access_key_id);
            cmd.env("AWS_SECRET_ACCESS_KEY", &creds.secret_access_key);
            if let Some(ref region) = creds.region {
                cmd.env("AWS_DEFAULT_REGION", region);
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(&self, mut cmd: Command) -> StoreResult<Output> {
        cmd.output().map_err(|e| StoreError::ClientUnavailable {
            program: self.program.clone(),
            source: e,
        })
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("404") || stderr.contains("Not Found") || stderr.contains("NoSuchKey")
}

fn is_access_denied(stderr: &str) -> bool {
    stderr.contains("403") || stderr.contains("AccessDenied") || stderr.contains("Forbidden")
}

impl ObjectStore for AwsCliStore {
    fn upload(&self, local_path: &Path, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        let url = self.location.url(key);
        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors"])
            .arg(local_path)
            .arg(&url);

        debug!("[{}] aws s3 cp {} {}", self.profile.as_str(), local_path.display(), url);
        let output = self.run(cmd)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_access_denied(&stderr) {
            return Err(StoreError::AccessDenied { target: url });
        }
        Err(StoreError::ClientFailed {
            operation: "upload",
            target: url,
            stderr,
        })
    }

    fn download(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let url = self.location.url(key);
        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors"]).arg(&url).arg("-");

        debug!("[{}] aws s3 cp {} -", self.profile.as_str(), url);
        let output = self.run(cmd)?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found(&stderr) {
            return Ok(None);
        }
        if is_access_denied(&stderr) {
            return Err(StoreError::AccessDenied { target: url });
        }
        Err(StoreError::ClientFailed {
            operation: "download",
            target: url,
            stderr,
        })
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let url = self.location.to_string();
        let mut cmd = self.command();
        cmd.args(["s3", "ls"]).arg(&url);

        let output = self.run(cmd)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // `aws s3 ls` exits 1 with empty stderr for an empty prefix
            if stderr.is_empty() {
                return Ok(Vec::new());
            }
            return Err(StoreError::ClientFailed {
                operation: "list",
                target: url,
                stderr,
            });
        }

        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    fn describe(&self) -> String {
        format!("{} ({} profile)", self.location, self.profile.as_str())
    }
}

/// Parse `aws s3 ls` output: `2024-01-01 12:00:00     1234 key`.
fn parse_listing(stdout: &str) -> Vec<String> {
    let mut keys: Vec<String> = stdout
        .lines()
        .filter(|line| !line.trim_start().starts_with("PRE "))
        .filter_map(|line| line.split_whitespace().nth(3))
        .map(str::to_string)
        .collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let out = "2024-05-01 10:00:00        512 manifest.latest.yaml\n\
                   2024-05-01 10:00:00      20480 artifact.abc.tar.gz\n\
                                              PRE nested/\n";
        assert_eq!(
            parse_listing(out),
            vec!["artifact.abc.tar.gz".to_string(), "manifest.latest.yaml".to_string()]
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found("fatal error: An error occurred (404) when calling the HeadObject operation: Not Found"));
        assert!(is_access_denied("An error occurred (AccessDenied) when calling the GetObject operation"));
        assert!(!is_not_found("Could not connect to the endpoint URL"));
    }

    #[test]
    fn test_missing_program_is_client_unavailable() {
        let store = AwsCliStore::new(StoreLocation::new("b", None), Profile::Agent)
            .with_program("/nonexistent/pupistry-aws-client");
        let err = store.download("manifest.latest.yaml").unwrap_err();
        assert!(matches!(err, StoreError::ClientUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_client_invocation_through_custom_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let client = dir.path().join("aws");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$AWS_ACCESS_KEY_ID $*\" >> '{log}'\n\
             case \"$*\" in\n\
             *missing*) echo 'An error occurred (404) when calling the HeadObject operation: Not Found' >&2; exit 1 ;;\n\
             *' -') printf 'manifest bytes' ;;\n\
             esac\n",
            log = log.display()
        );
        std::fs::write(&client, script).unwrap();
        std::fs::set_permissions(&client, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = AwsCliStore::new(StoreLocation::new("configs", Some("site".to_string())), Profile::Build)
            .with_program(client.to_string_lossy())
            .with_credentials(Some(Credentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                region: None,
            }))
            .with_endpoint(Some("https://s3.internal".to_string()));

        assert_eq!(
            store.download("manifest.latest.yaml").unwrap(),
            Some(b"manifest bytes".to_vec())
        );
        assert_eq!(store.download("manifest.missing.yaml").unwrap(), None);

        let local = dir.path().join("artifact.tar.gz");
        std::fs::write(&local, b"blob").unwrap();
        store.upload(&local, "artifact.abc.tar.gz").unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.starts_with("AKIDEXAMPLE --endpoint-url https://s3.internal s3 cp")));
        assert!(calls[0].ends_with("s3://configs/site/manifest.latest.yaml -"));
        assert!(calls[2].ends_with(&format!("{} s3://configs/site/artifact.abc.tar.gz", local.display())));
        assert!(!calls.iter().any(|c| c.contains("secret")));
    }
}
