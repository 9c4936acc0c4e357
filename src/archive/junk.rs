//! Platform debris that must never reach a published working tree.

/// Top-level directory macOS Archive Utility adds to every zip it creates.
const RESOURCE_FORK_DIR: &str = "__MACOSX";

/// Prefix of AppleDouble resource-fork sidecar files.
const RESOURCE_FORK_PREFIX: &str = "._";

/// Finder metadata cache and Windows shell files.
const DEBRIS_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// Returns `true` when `path` (slash-separated, relative to the archive root
/// after prefix stripping) names platform debris.
///
/// Matching is case-sensitive.  Directory entries with a trailing slash are
/// judged by their last non-empty segment.
pub fn is_junk(path: &str) -> bool {
    let base = base_name(path);

    if base.starts_with(RESOURCE_FORK_PREFIX) {
        return true;
    }

    if path == RESOURCE_FORK_DIR
        || path
            .strip_prefix(RESOURCE_FORK_DIR)
            .is_some_and(|rest| rest.starts_with('/'))
    {
        return true;
    }

    DEBRIS_FILES.contains(&base)
}

fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
