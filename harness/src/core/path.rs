//! Path-boundary resolution.
//!
//! Target paths from providers are untrusted. [`resolve_within`] answers the
//! only question the policy gate asks: does this path, after `..`/`.`
//! normalization and symlink resolution, stay inside the repository root?

use std::path::{Component, Path, PathBuf};

/// Resolve `candidate` against `root` and return the absolute path if it
/// stays inside the root. Returns `None` when the path escapes, when the
/// root itself cannot be canonicalized, or when a symlinked ancestor points
/// outside the root.
///
/// The candidate does not need to exist yet: the deepest existing ancestor
/// is canonicalized (resolving symlinks) and the non-existing remainder is
/// appended lexically.
pub fn resolve_within(root: &Path, candidate: &str) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let raw = Path::new(candidate);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };
    let normalized = normalize_lexically(&joined)?;
    let resolved = resolve_existing_prefix(&normalized)?;
    if resolved.starts_with(&root) {
        Some(resolved)
    } else {
        None
    }
}

/// Remove `.` components and fold `..` into the preceding component without
/// touching the filesystem. Returns `None` when `..` would climb past the
/// filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// non-existing tail. This resolves symlinks in directories that already
/// exist while still permitting paths that will be created by the action.
fn resolve_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if existing.exists() {
            let canonical = existing.canonicalize().ok()?;
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Some(out);
        }
        let name = existing.file_name()?.to_os_string();
        tail.push(name);
        existing = existing.parent()?.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn relative_path_inside_root_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = resolve_within(dir.path(), "src/lib.rs").expect("inside root");
        assert!(resolved.starts_with(dir.path().canonicalize().expect("canon")));
        assert!(resolved.ends_with("src/lib.rs"));
    }

    #[test]
    fn parent_traversal_escaping_root_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(resolve_within(dir.path(), "../../etc/passwd").is_none());
        assert!(resolve_within(dir.path(), "a/../../outside").is_none());
    }

    #[test]
    fn traversal_that_stays_inside_root_is_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = resolve_within(dir.path(), "a/b/../c").expect("inside root");
        assert!(resolved.ends_with("a/c"));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(resolve_within(dir.path(), "/etc/passwd").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_pointing_outside_is_rejected() {
        let outside = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape"))
            .expect("symlink");
        assert!(resolve_within(root.path(), "escape/file.txt").is_none());
    }

    #[test]
    fn existing_file_resolves_to_its_canonical_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("real.txt"), "x").expect("write");
        let resolved = resolve_within(dir.path(), "real.txt").expect("inside root");
        assert!(resolved.is_file());
    }
}
