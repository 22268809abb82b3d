use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{RegistryClient, RegistryError};
use crate::reference::ImageReference;

/// Container CLIs that understand `pull`, `tag` and `push`, in detection order.
pub const SUPPORTED_RUNTIMES: &[&str] = &["docker", "podman", "nerdctl"];

/// Push errors containing any of these are not retried.
const PERMANENT_PUSH_ERRORS: &[&str] = &["denied", "unauthorized", "forbidden", "not found"];

/// Drives registry operations through a container CLI (`docker`/`podman`/`nerdctl`).
pub struct CliRegistryClient {
    program: String,
}

impl CliRegistryClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// First supported container CLI on PATH that answers `--version`.
    pub async fn detect() -> Option<&'static str> {
        for &program in SUPPORTED_RUNTIMES {
            let answered = Command::new(program)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await
                .is_ok_and(|status| status.success());
            if answered {
                return Some(program);
            }
        }
        None
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the CLI; on failure return its trimmed stderr.
    async fn run(&self, args: &[&str]) -> Result<(), RunFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing command: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|err| RunFailure::Spawn(format!("failed to run {}: {err}", self.program)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RunFailure::Exited(match stderr.trim() {
            "" => format!("{} exited with {}", self.program, output.status),
            trimmed => trimmed.to_string(),
        }))
    }
}

enum RunFailure {
    /// The CLI could not be started at all
    Spawn(String),
    /// The CLI ran and exited non-zero
    Exited(String),
}

impl RunFailure {
    fn into_message(self) -> String {
        match self {
            RunFailure::Spawn(message) | RunFailure::Exited(message) => message,
        }
    }
}

#[async_trait]
impl RegistryClient for CliRegistryClient {
    async fn pull(&self, image: &ImageReference) -> Result<(), RegistryError> {
        let reference = image.to_string();
        info!("Pulling image: {}", reference);
        self.run(&["pull", &reference])
            .await
            .map_err(|err| RegistryError::Pull {
                reference,
                message: err.into_message(),
            })
    }

    async fn tag(&self, from: &ImageReference, to: &ImageReference) -> Result<(), RegistryError> {
        let from = from.to_string();
        let to = to.tagged_name();
        debug!("Tagging {} as {}", from, to);
        self.run(&["tag", &from, &to])
            .await
            .map_err(|err| RegistryError::Tag {
                from,
                to,
                message: err.into_message(),
            })
    }

    async fn push(&self, image: &ImageReference) -> Result<(), RegistryError> {
        let reference = image.tagged_name();
        info!("Pushing image to registry: {}", reference);
        self.run(&["push", &reference]).await.map_err(|err| {
            let transient = match &err {
                RunFailure::Spawn(_) => false,
                RunFailure::Exited(message) => {
                    let lower = message.to_ascii_lowercase();
                    !PERMANENT_PUSH_ERRORS
                        .iter()
                        .any(|needle| lower.contains(needle))
                }
            };
            RegistryError::Push {
                reference,
                message: err.into_message(),
                transient,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(token: &str) -> ImageReference {
        ImageReference::parse(token).unwrap()
    }

    #[tokio::test]
    async fn test_detect_only_reports_supported_runtimes() {
        if let Some(program) = CliRegistryClient::detect().await {
            assert!(SUPPORTED_RUNTIMES.contains(&program));
        }
    }

    #[tokio::test]
    async fn test_missing_program_fails_pull() {
        let client = CliRegistryClient::new("korp-test-no-such-runtime");
        let err = client.pull(&r("nginx")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Pull { ref reference, .. } if reference == "docker.io/library/nginx:latest"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_program_push_is_not_transient() {
        let client = CliRegistryClient::new("korp-test-no-such-runtime");
        let err = client.push(&r("corp.example.com/app:1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Push { transient: false, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_status_when_stderr_is_empty() {
        let client = CliRegistryClient::new("false");
        let err = client.tag(&r("nginx"), &r("corp.example.com/library/nginx")).await.unwrap_err();
        match err {
            RegistryError::Tag { from, to, message } => {
                assert_eq!(from, "docker.io/library/nginx:latest");
                assert_eq!(to, "corp.example.com/library/nginx:latest");
                assert!(message.contains("false exited with"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
