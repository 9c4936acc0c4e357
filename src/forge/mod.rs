//! Forge backend abstraction layer.
//!
//! Provides the [`ForgeBackend`] trait that encapsulates the repository
//! management API of the hosting server.  The upload pipeline only ever talks
//! to the forge through this trait, so no URL construction or response
//! parsing leaks outside this module.

pub mod gitea;

use anyhow::Result;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Repository naming
// ---------------------------------------------------------------------------

const REPO_PREFIX: &str = "project-";
const MAX_PROJECT_ID_LEN: usize = 100;

/// Derive the repository name for a caller-supplied project identifier.
pub fn repo_name(project_id: &str) -> String {
    format!("{REPO_PREFIX}{project_id}")
}

/// Check that a project identifier can be used verbatim as one path segment
/// of both the sandbox directory and the forge API URLs.
pub fn validate_project_id(project_id: &str) -> Result<(), String> {
    if project_id.is_empty() {
        return Err("project_id required".to_string());
    }
    if project_id.len() > MAX_PROJECT_ID_LEN {
        return Err(format!(
            "project_id longer than {MAX_PROJECT_ID_LEN} characters"
        ));
    }
    if project_id == "." || project_id == ".." {
        return Err("project_id must not be a relative path segment".to_string());
    }
    if let Some(bad) = project_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("project_id contains invalid character {bad:?}"));
    }
    Ok(())
}

/// Replace every occurrence of each secret in `text`.
///
/// Git echoes remote URLs (including embedded credentials) in its diagnostics,
/// and those diagnostics are surfaced to API callers.
pub fn redact<S: AsRef<str>>(text: &str, secrets: &[S]) -> String {
    secrets
        .iter()
        .map(AsRef::as_ref)
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, "***"))
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Outcome of [`ForgeBackend::ensure_repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    Existing,
    Created,
}

/// Abstraction over the hosting server's repository management endpoints.
#[async_trait::async_trait]
pub trait ForgeBackend: Send + Sync {
    /// Make sure a public, empty-on-creation repository called `name` exists
    /// under the configured owner.  Idempotent, including under concurrent
    /// creation races.
    async fn ensure_repository(&self, name: &str) -> Result<RepoStatus>;

    /// Remove the repository.  An already-absent repository is not an error.
    async fn delete_repository(&self, name: &str) -> Result<()>;

    /// Publicly reachable clone URL handed back to callers.
    fn clone_url(&self, name: &str) -> String;

    /// Authenticated URL the sync engine pushes to.
    fn push_url(&self, name: &str) -> Result<String>;

    /// Every spelling of the secret embedded in [`ForgeBackend::push_url`]
    /// (raw and URL-encoded), for redaction.
    fn push_secrets(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the Gitea backend from configuration.
pub fn build_backend(config: &Config) -> Result<Box<dyn ForgeBackend>> {
    Ok(Box::new(gitea::GiteaBackend::new(config)?))
}
