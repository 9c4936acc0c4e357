//! Zip extraction into an upload sandbox.
//!
//! Entries pass through three gates before anything touches the disk:
//! common-root stripping, the junk filter, and path containment.  Entries that
//! fail containment are dropped silently (with a warning) rather than failing
//! the whole upload.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use super::junk::is_junk;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive is corrupted: {0}")]
    Corrupted(#[from] zip::result::ZipError),

    #[error("failed to extract '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl ExtractError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What happened to the entries of one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
    pub skipped_junk: usize,
    pub skipped_unsafe: usize,
    pub skipped_symlinks: usize,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract the zip archive held in `bytes` into `dest`, which must exist.
///
/// Blocking; callers on the async runtime should use `spawn_blocking`.
pub fn extract(bytes: &[u8], dest: &Path) -> Result<ExtractReport, ExtractError> {
    let root = dest
        .canonicalize()
        .map_err(|e| ExtractError::io(dest, e))?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut report = ExtractReport::default();

    let prefix = if archive.len() == 0 {
        None
    } else {
        common_root_prefix(archive.by_index_raw(0)?.name())
    };
    debug!(entries = archive.len(), prefix = ?prefix, "extracting archive");

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().replace('\\', "/");
        let name = match &prefix {
            Some(p) => raw_name.strip_prefix(p.as_str()).unwrap_or(&raw_name),
            None => raw_name.as_str(),
        };

        if name.is_empty() {
            continue;
        }
        let Some(relative) = sanitize_entry_path(name) else {
            warn!(entry = %raw_name, "dropping entry that escapes the sandbox");
            report.skipped_unsafe += 1;
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if is_junk(&slash_path(&relative)) {
            debug!(entry = %raw_name, "skipping junk entry");
            report.skipped_junk += 1;
            continue;
        }
        if touches_git_dir(&relative) {
            warn!(entry = %raw_name, "dropping entry inside a .git directory");
            report.skipped_unsafe += 1;
            continue;
        }

        let unix_mode = entry.unix_mode();
        if unix_mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            warn!(entry = %raw_name, "dropping symlink entry");
            report.skipped_symlinks += 1;
            continue;
        }
        let permissions = unix_mode.map(|m| m & 0o777);

        let target = root.join(&relative);
        if !ancestor_contained(&root, &target).map_err(|e| ExtractError::io(&target, e))? {
            warn!(entry = %raw_name, "dropping entry whose resolved path leaves the sandbox");
            report.skipped_unsafe += 1;
            continue;
        }

        if entry.is_dir() {
            create_dir_all(&target, permissions.unwrap_or(DEFAULT_DIR_MODE) | 0o700)
                .map_err(|e| ExtractError::io(&target, e))?;
            report.directories += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            create_dir_all(parent, DEFAULT_DIR_MODE).map_err(|e| ExtractError::io(parent, e))?;
        }
        if fs::symlink_metadata(&target).is_ok_and(|m| m.file_type().is_symlink()) {
            warn!(entry = %raw_name, "refusing to write through an existing symlink");
            report.skipped_unsafe += 1;
            continue;
        }

        let mut out = open_truncate(&target, permissions.unwrap_or(DEFAULT_FILE_MODE) | 0o600)
            .map_err(|e| ExtractError::io(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| ExtractError::io(&target, e))?;
        report.files += 1;
    }

    debug!(?report, "archive extracted");
    Ok(report)
}

/// The leading `segment/` of the first entry, if it has one.
fn common_root_prefix(first_entry: &str) -> Option<String> {
    let first = first_entry.replace('\\', "/");
    first.find('/').map(|idx| first[..=idx].to_string())
}

/// Resolve `.` and `..` segments of a slash-separated entry name.
///
/// Returns `None` for absolute names, names containing NUL, and names whose
/// `..` segments climb above the archive root.
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    if name.starts_with('/') || name.contains('\0') {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }

    let path: PathBuf = segments.iter().collect();
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(path)
}

/// `relative` with `/` separators, the form the junk filter matches on.
fn slash_path(relative: &Path) -> String {
    relative
        .iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether any segment names a git metadata directory.  Such entries would
/// hand the archive control over hooks and config of the publishing repo.
fn touches_git_dir(relative: &Path) -> bool {
    relative
        .iter()
        .any(|segment| segment.to_string_lossy().eq_ignore_ascii_case(".git"))
}

/// Canonicalize the deepest existing ancestor of `target` and check that it
/// lies inside `root` (itself canonical).
fn ancestor_contained(root: &Path, target: &Path) -> io::Result<bool> {
    let mut probe = target;
    loop {
        match fs::symlink_metadata(probe) {
            Ok(_) => return Ok(probe.canonicalize()?.starts_with(root)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match probe.parent() {
                Some(parent) => probe = parent,
                None => return Ok(false),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn create_dir_all(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

#[cfg(not(unix))]
fn create_dir_all(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_truncate(path: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_truncate(path: &Path, _mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
