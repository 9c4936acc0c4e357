//! Git command wrappers using [`tokio::process::Command`].
//!
//! [`GitCli`] implements [`SyncBackend`] by shelling out to the system `git`
//! binary.  Every invocation runs with `GIT_TERMINAL_PROMPT=0`, a deadline,
//! and `kill_on_drop`, so an expired deadline or a dropped request never
//! leaves a child process behind.  Hooks and fsmonitor are disabled on every
//! call: the working tree comes from an untrusted archive.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::Config;

use super::publish::{Step, StepError, SyncBackend};

/// Config overrides placed before every subcommand.
const HARDENING: &[&str] = &[
    "-c",
    "core.hooksPath=/dev/null",
    "-c",
    "core.fsmonitor=false",
];

pub struct GitCli {
    binary: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.git.binary.clone(),
            Duration::from_secs(config.timeouts.git_secs),
        )
    }

    /// Run `git <args>` inside `dir`, mapping every failure mode to a
    /// [`StepError`] for `step`.
    async fn run(&self, dir: &Path, step: Step, args: &[&str]) -> Result<Output, StepError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(HARDENING)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(StepError::new(
                    step,
                    format!("git timed out after {:?}", self.timeout),
                ))
            }
            Ok(Err(e)) => {
                return Err(StepError::new(
                    step,
                    format!("failed to spawn {}: {e}", self.binary),
                ))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(StepError::new(
                step,
                format!("({}) {}", output.status, combined_output(&output)),
            ));
        }
        Ok(output)
    }
}

/// stdout followed by stderr, trimmed.
fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    [stdout.trim(), stderr.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait::async_trait]
impl SyncBackend for GitCli {
    #[instrument(skip(self), fields(dir = %dir.display()))]
    async fn init(&self, dir: &Path) -> Result<(), StepError> {
        self.run(dir, Step::Init, &["init", "--quiet"]).await?;
        Ok(())
    }

    async fn configure_identity(
        &self,
        dir: &Path,
        name: &str,
        email: &str,
    ) -> Result<(), StepError> {
        self.run(dir, Step::ConfigureIdentity, &["config", "user.email", email])
            .await?;
        self.run(dir, Step::ConfigureIdentity, &["config", "user.name", name])
            .await?;
        Ok(())
    }

    async fn stage_all(&self, dir: &Path) -> Result<(), StepError> {
        // --force: ignore files shipped in the archive still get published.
        self.run(dir, Step::StageAll, &["add", "--all", "--force", "."])
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %dir.display()))]
    async fn commit(&self, dir: &Path, message: &str) -> Result<(), StepError> {
        self.run(
            dir,
            Step::Commit,
            &[
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--quiet",
                "--allow-empty",
                "--no-verify",
                "-m",
                message,
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_primary_branch(&self, dir: &Path, branch: &str) -> Result<(), StepError> {
        self.run(dir, Step::SetPrimaryBranch, &["branch", "-M", branch])
            .await?;
        Ok(())
    }

    /// Queries `git remote get-url` first and only adds the remote when it is
    /// missing, so the "already exists" fallback in the publisher is reached
    /// only if another process registers the remote in between.
    #[instrument(skip(self, url), fields(dir = %dir.display()))]
    async fn register_remote(&self, dir: &Path, remote: &str, url: &str) -> Result<(), StepError> {
        let exists = self
            .run(dir, Step::RegisterRemote, &["remote", "get-url", remote])
            .await
            .is_ok();

        if exists {
            debug!("remote exists; updating URL");
            self.run(dir, Step::RegisterRemote, &["remote", "set-url", remote, url])
                .await?;
        } else {
            self.run(dir, Step::RegisterRemote, &["remote", "add", remote, url])
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %dir.display()))]
    async fn force_push(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), StepError> {
        self.run(
            dir,
            Step::ForcePush,
            &["push", "--force", "--quiet", remote, branch],
        )
        .await?;
        debug!("force push complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
