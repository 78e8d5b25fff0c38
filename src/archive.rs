//! Packing the finished boot tree.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::fakeroot::{FakeRoot, FsOp};

/// Pack `target_dir` into `output_dir/archive_name`.
///
/// The archive is written inside `target_dir` first and moved to its final
/// location only once complete, so a partial file never appears at the
/// destination. `target_dir` is removed afterwards.
pub fn pack(
    shell: &mut FakeRoot,
    target_dir: &Path,
    archive_name: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    let destination = output_dir.join(archive_name);
    if destination.is_dir() {
        return Err(BuildError::io(
            &destination,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "a directory is in the way"),
        ));
    }

    let partial = target_dir.join(format!(".{}.partial", archive_name));
    let output = shell.run(&FsOp::archive(".", &partial), target_dir, true)?;
    let entries = output.stdout.lines().count();

    shell.run(&FsOp::mkdir_p(output_dir), target_dir, true)?;
    shell.run(&FsOp::mv(&partial, &destination), target_dir, true)?;
    shell.run(&FsOp::remove(target_dir), output_dir, true)?;

    tracing::info!(archive = %destination.display(), entries, "archive written");
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_pack_moves_archive_and_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let output = dir.path().join("out/nested");
        fs::create_dir_all(target.join("boot")).unwrap();
        fs::write(target.join("boot/vmlinuz"), "kernel").unwrap();

        let mut shell = FakeRoot::new();
        let archive = pack(&mut shell, &target, "boot.tar", &output).unwrap();

        assert_eq!(archive, output.join("boot.tar"));
        assert!(archive.is_file());
        assert!(!target.exists());
        assert_eq!(names(&archive), vec![".", "boot", "boot/vmlinuz"]);
    }

    #[test]
    fn test_pack_replaces_existing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let output = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(target.join("hostname"), "ebcl").unwrap();
        fs::write(output.join("boot.tar"), "stale").unwrap();

        let mut shell = FakeRoot::new();
        let archive = pack(&mut shell, &target, "boot.tar", &output).unwrap();
        assert_eq!(names(&archive), vec![".", "hostname"]);
    }

    #[test]
    fn test_directory_at_destination_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let output = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(output.join("boot.tar")).unwrap();

        let mut shell = FakeRoot::new();
        assert!(pack(&mut shell, &target, "boot.tar", &output).is_err());
        assert!(target.exists());
    }
}
