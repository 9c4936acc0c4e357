//! Force-publishing a working directory as a single-commit branch.
//!
//! [`SyncBackend`] is the synchronization capability: the seven primitive
//! steps the publisher needs from a version-control implementation.
//! [`publish`] drives them in a fixed order and owns the one tolerated
//! failure (a remote that is already registered).

use std::fmt;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::GitConfig;

// ---------------------------------------------------------------------------
// Steps and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    ConfigureIdentity,
    StageAll,
    Commit,
    SetPrimaryBranch,
    RegisterRemote,
    ForcePush,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Init => "init",
            Step::ConfigureIdentity => "configure identity",
            Step::StageAll => "stage",
            Step::Commit => "commit",
            Step::SetPrimaryBranch => "set branch",
            Step::RegisterRemote => "register remote",
            Step::ForcePush => "push",
        })
    }
}

/// A failed step together with the tool's diagnostic output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{step} failed: {output}")]
pub struct StepError {
    pub step: Step,
    pub output: String,
}

impl StepError {
    pub fn new(step: Step, output: impl Into<String>) -> Self {
        Self {
            step,
            output: output.into(),
        }
    }

    /// Whether the diagnostic says the thing being created already exists.
    ///
    /// Fragile by nature (it matches tool output text); only consulted for
    /// [`Step::RegisterRemote`].
    pub fn is_already_exists(&self) -> bool {
        self.output.contains("already exists")
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync {
    /// Start tracking `dir`.  Must succeed if `dir` is already tracked.
    async fn init(&self, dir: &Path) -> Result<(), StepError>;

    async fn configure_identity(&self, dir: &Path, name: &str, email: &str)
        -> Result<(), StepError>;

    /// Stage every file currently in the working tree.
    async fn stage_all(&self, dir: &Path) -> Result<(), StepError>;

    /// Record one commit, even when the tree is empty.
    async fn commit(&self, dir: &Path, message: &str) -> Result<(), StepError>;

    /// Rename (or create) the current branch to `branch`.
    async fn set_primary_branch(&self, dir: &Path, branch: &str) -> Result<(), StepError>;

    /// Point `remote` at `url`, adding or updating the registration.
    async fn register_remote(&self, dir: &Path, remote: &str, url: &str)
        -> Result<(), StepError>;

    /// Overwrite `branch` on `remote` regardless of its current history.
    async fn force_push(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), StepError>;
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub fn commit_message(now: DateTime<Utc>) -> String {
    format!("Upload at {}", now.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Commit everything in `dir` and force-push it to `remote_url`.
///
/// Steps run strictly in order and the first failure aborts, except a
/// remote registration whose diagnostic reports "already exists".
#[instrument(skip(sync, git, remote_url), fields(dir = %dir.display()))]
pub async fn publish(
    sync: &dyn SyncBackend,
    dir: &Path,
    git: &GitConfig,
    remote_url: &str,
) -> Result<(), StepError> {
    sync.init(dir).await?;
    sync.configure_identity(dir, &git.user_name, &git.user_email)
        .await?;
    sync.stage_all(dir).await?;
    sync.commit(dir, &commit_message(Utc::now())).await?;
    sync.set_primary_branch(dir, &git.branch).await?;

    match sync.register_remote(dir, &git.remote, remote_url).await {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {
            warn!(remote = %git.remote, "remote already registered; continuing");
        }
        Err(e) => return Err(e),
    }
    debug!(remote = %git.remote, "remote registered");

    sync.force_push(dir, &git.remote, &git.branch).await?;
    info!(branch = %git.branch, "published");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
