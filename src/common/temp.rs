//! Per-build staging directories.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::error::{BuildError, Result};

/// Create a fresh, uniquely named staging directory below `parent`.
///
/// The directory is removed when the returned guard is dropped, so a build
/// that fails half way does not leave staging trees behind.
pub fn staging_dir(parent: &Path, prefix: &str) -> Result<TempDir> {
    fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| BuildError::io(parent, e))
}

/// Remove a staging directory now, reporting failures.
pub fn cleanup_staging_dir(dir: TempDir) -> Result<()> {
    let path = dir.path().to_path_buf();
    dir.close().map_err(|e| BuildError::io(path, e))
}

/// Remove a directory tree if it exists. Errors are ignored.
pub fn cleanup_work_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_dirs_are_unique_and_removed() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("staging");
        let a = staging_dir(&root, "bootgen-test-").unwrap();
        let b = staging_dir(&root, "bootgen-test-").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(&root));

        let path = a.path().to_path_buf();
        cleanup_staging_dir(a).unwrap();
        assert!(!path.exists());

        let path = b.path().to_path_buf();
        drop(b);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }
}
