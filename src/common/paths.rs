//! Path helpers shared by the shell and the pipeline stages.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `cwd` and normalize it lexically.
///
/// `.` components are dropped and `..` pops the previous component. The
/// filesystem is not consulted, so symlinks are not resolved; every stage
/// names the same file by the same path.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    normalize(&joined)
}

/// Lexically normalize a path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `path` inside `root` in archive form (`.` for the root itself).
pub fn archive_name(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(PathBuf::from(".").join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolutize_relative() {
        assert_eq!(
            absolutize(Path::new("./boot/../etc/hostname"), Path::new("/tmp/target")),
            PathBuf::from("/tmp/target/etc/hostname")
        );
    }

    #[test]
    fn test_absolutize_keeps_absolute() {
        assert_eq!(
            absolutize(Path::new("/a/b/./c"), Path::new("/ignored")),
            PathBuf::from("/a/b/c")
        );
    }

    #[test]
    fn test_archive_name() {
        let root = Path::new("/tmp/target");
        assert_eq!(archive_name(root, root), Some(PathBuf::from(".")));
        assert_eq!(
            archive_name(root, &root.join("boot/vmlinuz")),
            Some(PathBuf::from("./boot/vmlinuz"))
        );
        assert_eq!(archive_name(root, Path::new("/elsewhere")), None);
    }
}
