//! Upload orchestration: archive bytes in, published clone URL out.
//!
//! One upload walks `received -> sandbox prepared -> extracted -> repository
//! ensured -> published`.  The sandbox directory is owned by a [`Sandbox`]
//! guard from the moment it is created, so it is removed on every exit path,
//! and the whole walk runs under the per-repository lock so two uploads for
//! the same project never share a sandbox or interleave their pushes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::archive::{self, ExtractError};
use crate::config::Config;
use crate::coordination::KeyedLocks;
use crate::forge::{self, ForgeBackend, RepoStatus};
use crate::git::publish::{publish, SyncBackend};
use crate::metrics::{MetricsRegistry, OutcomeLabels, SkipLabels, SkipReason, UploadOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),

    #[error("unzip failed: {0}")]
    CorruptArchive(String),

    #[error("unzip failed: {0}")]
    SandboxIo(String),

    #[error("ensure repo failed: {0}")]
    Provisioning(String),

    #[error("git push failed: {0}")]
    Publish(String),
}

impl UploadError {
    pub fn outcome(&self) -> UploadOutcome {
        match self {
            UploadError::Validation(_) => UploadOutcome::Validation,
            UploadError::CorruptArchive(_) => UploadOutcome::CorruptArchive,
            UploadError::SandboxIo(_) => UploadOutcome::SandboxIo,
            UploadError::Provisioning(_) => UploadOutcome::Provisioning,
            UploadError::Publish(_) => UploadOutcome::Publish,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("{0}")]
    Validation(String),

    #[error("delete failed: {0}")]
    Forge(String),
}

impl From<ExtractError> for UploadError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Corrupted(_) => UploadError::CorruptArchive(err.to_string()),
            ExtractError::Io { .. } => UploadError::SandboxIo(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Exclusively owned staging directory for one upload; removed on drop.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    /// Create `root/name` fresh, discarding whatever a previous failed run
    /// left there.
    pub async fn prepare(root: &Path, name: &str) -> io::Result<Self> {
        let path = root.join(name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale sandbox"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(root).await?;
        tokio::fs::create_dir(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // Synchronous so the directory is gone before the repository lock is
        // released to the next upload for the same project.
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "sandbox removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove sandbox"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Uploader {
    config: Arc<Config>,
    forge: Arc<dyn ForgeBackend>,
    sync: Arc<dyn SyncBackend>,
    locks: KeyedLocks,
    metrics: MetricsRegistry,
}

impl Uploader {
    pub fn new(
        config: Arc<Config>,
        forge: Arc<dyn ForgeBackend>,
        sync: Arc<dyn SyncBackend>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            config,
            forge,
            sync,
            locks: KeyedLocks::new(),
            metrics,
        }
    }

    /// Publish `archive` as the full content of the project's repository and
    /// return the repository's public clone URL.
    #[instrument(skip(self, archive), fields(archive_bytes = archive.len()))]
    pub async fn process_upload(&self, project_id: &str, archive: Bytes) -> Result<String, UploadError> {
        let started = Instant::now();
        let result = self.run_upload(project_id, archive).await;

        let outcome = match &result {
            Ok(_) => UploadOutcome::Success,
            Err(e) => e.outcome(),
        };
        let m = &self.metrics.metrics;
        m.uploads_total.get_or_create(&OutcomeLabels { outcome }).inc();
        m.upload_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(url) => info!(%url, "upload published"),
            Err(e) => warn!(error = %e, "upload failed"),
        }
        result
    }

    async fn run_upload(&self, project_id: &str, archive: Bytes) -> Result<String, UploadError> {
        forge::validate_project_id(project_id).map_err(UploadError::Validation)?;
        let name = forge::repo_name(project_id);

        // Dropped after `sandbox`, so cleanup finishes while still locked.
        let _lock = self.locks.lock(&name).await;

        let sandbox = Sandbox::prepare(&self.config.sandbox.root, &name)
            .await
            .map_err(|e| UploadError::SandboxIo(format!("failed to prepare sandbox: {e}")))?;
        debug!(path = %sandbox.path().display(), "sandbox prepared");

        let dest = sandbox.path().to_path_buf();
        let report = tokio::task::spawn_blocking(move || archive::extract(&archive, &dest))
            .await
            .map_err(|e| UploadError::SandboxIo(format!("extraction task failed: {e}")))??;
        self.record_extraction(&report);
        debug!(?report, "archive extracted");

        let status = self
            .forge
            .ensure_repository(&name)
            .await
            .map_err(|e| UploadError::Provisioning(format!("{e:#}")))?;
        if status == RepoStatus::Created {
            self.metrics.metrics.repos_created_total.inc();
        }

        let push_url = self
            .forge
            .push_url(&name)
            .map_err(|e| UploadError::Provisioning(format!("{e:#}")))?;

        publish(self.sync.as_ref(), sandbox.path(), &self.config.git, &push_url)
            .await
            .map_err(|e| {
                UploadError::Publish(forge::redact(&e.to_string(), &self.forge.push_secrets()))
            })?;

        Ok(self.forge.clone_url(&name))
    }

    /// Remove the project's repository.  Missing repositories are fine.
    #[instrument(skip(self))]
    pub async fn delete_project(&self, project_id: &str) -> Result<(), DeleteError> {
        forge::validate_project_id(project_id).map_err(DeleteError::Validation)?;
        let name = forge::repo_name(project_id);
        let _lock = self.locks.lock(&name).await;

        self.forge
            .delete_repository(&name)
            .await
            .map_err(|e| DeleteError::Forge(format!("{e:#}")))?;
        self.metrics.metrics.deletes_total.inc();
        info!(repo = %name, "repository deleted");
        Ok(())
    }

    fn record_extraction(&self, report: &archive::ExtractReport) {
        let m = &self.metrics.metrics;
        m.extracted_entries_total
            .inc_by((report.files + report.directories) as u64);
        for (reason, count) in [
            (SkipReason::Junk, report.skipped_junk),
            (SkipReason::Unsafe, report.skipped_unsafe),
            (SkipReason::Symlink, report.skipped_symlinks),
        ] {
            if count > 0 {
                m.skipped_entries_total
                    .get_or_create(&SkipLabels { reason })
                    .inc_by(count as u64);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;

    use super::*;
    use crate::archive::extract::tests::{build_zip, Entry};
    use crate::git::commands::tests::{init_bare, tree_files};
    use crate::git::commands::GitCli;

    /// Forge backed by bare repositories in a local directory.
    pub(crate) struct LocalForge {
        pub root: PathBuf,
        pub secret: String,
        pub created: AtomicUsize,
        pub fail_ensure: bool,
        pub fail_delete: bool,
    }

    impl LocalForge {
        pub(crate) fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                secret: String::new(),
                created: AtomicUsize::new(0),
                fail_ensure: false,
                fail_delete: false,
            }
        }

        pub(crate) fn repo_path(&self, name: &str) -> PathBuf {
            self.root.join(format!("{name}.git"))
        }
    }

    #[async_trait::async_trait]
    impl ForgeBackend for LocalForge {
        async fn ensure_repository(&self, name: &str) -> Result<RepoStatus> {
            anyhow::ensure!(!self.fail_ensure, "create repo failed (500): disk quota");
            let path = self.repo_path(name);
            if path.exists() {
                return Ok(RepoStatus::Existing);
            }
            init_bare(&path);
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(RepoStatus::Created)
        }

        async fn delete_repository(&self, name: &str) -> Result<()> {
            anyhow::ensure!(!self.fail_delete, "delete failed (403): token lacks scope");
            match std::fs::remove_dir_all(self.repo_path(name)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        }

        fn clone_url(&self, name: &str) -> String {
            format!("file://{}", self.repo_path(name).display())
        }

        fn push_url(&self, name: &str) -> Result<String> {
            if self.secret.is_empty() {
                Ok(self.repo_path(name).display().to_string())
            } else {
                Ok(format!("{}/{}/{name}.git", self.root.display(), self.secret))
            }
        }

        fn push_secrets(&self) -> Vec<String> {
            vec![self.secret.clone()]
        }
    }

    pub(crate) struct Harness {
        pub tmp: tempfile::TempDir,
        pub forge: Arc<LocalForge>,
        pub uploader: Uploader,
    }

    impl Harness {
        pub(crate) fn sandbox_root(&self) -> PathBuf {
            self.tmp.path().join("sandboxes")
        }
    }

    pub(crate) fn harness_with(configure: impl FnOnce(&mut LocalForge)) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let remotes = tmp.path().join("remotes");
        std::fs::create_dir(&remotes).unwrap();
        let mut forge = LocalForge::new(&remotes);
        configure(&mut forge);
        let forge = Arc::new(forge);

        let config = crate::config::test_config("http://gitea:3000", &tmp.path().join("sandboxes"));
        let uploader = Uploader::new(
            Arc::new(config),
            Arc::clone(&forge) as Arc<dyn ForgeBackend>,
            Arc::new(GitCli::new("git", Duration::from_secs(60))),
            MetricsRegistry::new(),
        );
        Harness {
            tmp,
            forge,
            uploader,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(|_| {})
    }

    #[tokio::test]
    async fn publishes_filtered_tree() {
        let h = harness();
        let zip = build_zip(&[
            Entry::Dir("proj/"),
            Entry::File("proj/index.html", "<h1>hi</h1>"),
            Entry::File("proj/__MACOSX/._index.html", "fork"),
        ]);

        let url = h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        let bare = h.forge.repo_path("project-abc123");
        assert_eq!(url, format!("file://{}", bare.display()));
        assert_eq!(tree_files(&bare, "main"), vec!["index.html"]);
    }

    #[tokio::test]
    async fn traversal_entries_never_leave_the_sandbox() {
        let h = harness();
        let zip = build_zip(&[
            Entry::File("index.html", "ok"),
            Entry::File("../../etc/passwd", "root:x:0:0"),
            Entry::File("../escape.txt", "nope"),
        ]);

        h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        assert!(!h.tmp.path().join("etc").exists());
        assert!(!h.sandbox_root().join("escape.txt").exists());
        assert!(!h.sandbox_root().join("etc").exists());
        let bare = h.forge.repo_path("project-abc123");
        assert_eq!(tree_files(&bare, "main"), vec!["index.html"]);
    }

    #[tokio::test]
    async fn archived_git_hooks_are_not_executed() {
        let h = harness();
        let marker = h.tmp.path().join("hook-ran");
        let hook = format!("#!/bin/sh\ntouch '{}'\n", marker.display());
        let zip = build_zip(&[
            Entry::File("index.html", "ok"),
            Entry::FileMode(".git/hooks/post-commit", &hook, 0o755),
            Entry::FileMode(".git/hooks/pre-push", &hook, 0o755),
            Entry::File(".git/config", "[core]\n\tfsmonitor = true\n"),
        ]);

        h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        assert!(!marker.exists());
        let bare = h.forge.repo_path("project-abc123");
        assert_eq!(tree_files(&bare, "main"), vec!["index.html"]);
    }

    #[tokio::test]
    async fn reupload_overwrites_and_keeps_url() {
        let h = harness();
        let first = build_zip(&[
            Entry::File("index.html", "v1"),
            Entry::File("old/page.html", "old"),
        ]);
        let second = build_zip(&[
            Entry::File("index.html", "v2"),
            Entry::File("new.css", "body {}"),
        ]);

        let url1 = h.uploader.process_upload("abc123", first.into()).await.unwrap();
        let url2 = h.uploader.process_upload("abc123", second.into()).await.unwrap();

        assert_eq!(url1, url2);
        assert_eq!(h.forge.created.load(Ordering::SeqCst), 1);
        let bare = h.forge.repo_path("project-abc123");
        assert_eq!(tree_files(&bare, "main"), vec!["index.html", "new.css"]);
    }

    #[tokio::test]
    async fn concurrent_uploads_for_same_project_serialize() {
        let h = Arc::new(harness());
        let mut handles = Vec::new();
        for i in 0..4 {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                let zip = build_zip(&[Entry::File(&format!("file-{i}.txt"), "x")]);
                h.uploader.process_upload("same", zip.into()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let files = tree_files(&h.forge.repo_path("project-same"), "main");
        assert_eq!(files.len(), 1);
        assert_eq!(h.forge.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sandbox_removed_after_success() {
        let h = harness();
        let zip = build_zip(&[Entry::File("index.html", "ok")]);

        h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        assert!(!h.sandbox_root().join("project-abc123").exists());
    }

    #[tokio::test]
    async fn corrupt_archive_fails_and_cleans_up() {
        let h = harness();

        let err = h
            .uploader
            .process_upload("abc123", Bytes::from_static(b"not a zip"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::CorruptArchive(_)));
        assert!(err.to_string().starts_with("unzip failed"));
        assert!(!h.sandbox_root().join("project-abc123").exists());
        assert_eq!(h.forge.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_sandbox_contents_are_discarded() {
        let h = harness();
        let stale = h.sandbox_root().join("project-abc123");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover.txt"), "stale").unwrap();
        let zip = build_zip(&[Entry::File("index.html", "ok")]);

        h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        let bare = h.forge.repo_path("project-abc123");
        assert_eq!(tree_files(&bare, "main"), vec!["index.html"]);
    }

    #[tokio::test]
    async fn invalid_project_id_is_rejected_before_any_work() {
        let h = harness();
        let zip = build_zip(&[Entry::File("index.html", "ok")]);

        let err = h
            .uploader
            .process_upload("../etc", zip.into())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Validation(_)));
        assert!(!h.sandbox_root().exists());
    }

    #[tokio::test]
    async fn provisioning_failure_is_reported_and_cleans_up() {
        let h = harness_with(|f| f.fail_ensure = true);
        let zip = build_zip(&[Entry::File("index.html", "ok")]);

        let err = h
            .uploader
            .process_upload("abc123", zip.into())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Provisioning(_)));
        assert!(err.to_string().contains("disk quota"));
        assert!(!h.sandbox_root().join("project-abc123").exists());
    }

    #[tokio::test]
    async fn publish_errors_do_not_leak_credentials() {
        let h = harness_with(|f| f.secret = "hunter2-push-token".to_string());
        let zip = build_zip(&[Entry::File("index.html", "ok")]);

        let err = h
            .uploader
            .process_upload("abc123", zip.into())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Publish(_)));
        assert!(!err.to_string().contains("hunter2-push-token"), "{err}");
    }

    #[tokio::test]
    async fn delete_failures_are_kept_out_of_upload_outcomes() {
        let h = harness_with(|f| f.fail_delete = true);

        let err = h.uploader.delete_project("abc123").await.unwrap_err();

        assert!(matches!(err, DeleteError::Forge(_)));
        assert!(err.to_string().starts_with("delete failed"));
        let m = &h.uploader.metrics.metrics;
        assert_eq!(m.deletes_total.get(), 0);
        let provisioning = m
            .uploads_total
            .get_or_create(&OutcomeLabels {
                outcome: UploadOutcome::Provisioning,
            })
            .get();
        assert_eq!(provisioning, 0);
    }

    #[tokio::test]
    async fn delete_rejects_invalid_project_id() {
        let h = harness();
        let err = h.uploader.delete_project("a/b").await.unwrap_err();
        assert!(matches!(err, DeleteError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_missing_project_succeeds() {
        let h = harness();
        h.uploader.delete_project("missing").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_published_repository() {
        let h = harness();
        let zip = build_zip(&[Entry::File("index.html", "ok")]);
        h.uploader.process_upload("abc123", zip.into()).await.unwrap();

        h.uploader.delete_project("abc123").await.unwrap();

        assert!(!h.forge.repo_path("project-abc123").exists());
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let h = harness();
        let zip = build_zip(&[
            Entry::File("index.html", "ok"),
            Entry::File(".DS_Store", "x"),
        ]);
        h.uploader.process_upload("abc123", zip.into()).await.unwrap();
        let _ = h
            .uploader
            .process_upload("abc123", Bytes::from_static(b"junk"))
            .await;

        let m = &h.uploader.metrics.metrics;
        let count = |outcome| {
            m.uploads_total
                .get_or_create(&OutcomeLabels { outcome })
                .get()
        };
        assert_eq!(count(UploadOutcome::Success), 1);
        assert_eq!(count(UploadOutcome::CorruptArchive), 1);
        assert_eq!(m.repos_created_total.get(), 1);
        assert_eq!(
            m.skipped_entries_total
                .get_or_create(&SkipLabels {
                    reason: SkipReason::Junk
                })
                .get(),
            1
        );
    }
}
