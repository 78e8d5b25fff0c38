//! Binary package repositories.
//!
//! The core only needs a lookup-by-name capability and a way to download the
//! artifact behind a [`Package`]; the index protocol stays behind the
//! [`Repository`] trait.

pub mod apt;

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

pub use apt::AptRepository;

/// Identity of a package: one artifact per (name, arch, repository).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub name: String,
    pub arch: String,
    pub repo: String,
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.name, self.arch, self.repo)
    }
}

/// Package metadata as published by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub arch: String,
    /// Id of the repository that published this package
    pub repo: String,
    pub depends: Vec<String>,
    /// Artifact path relative to the repository root
    pub filename: String,
    pub sha256: Option<String>,
}

impl Package {
    pub fn id(&self) -> PackageId {
        PackageId {
            name: self.name.clone(),
            arch: self.arch.clone(),
            repo: self.repo.clone(),
        }
    }

    /// Names this package declares a dependency on.
    pub fn get_depends(&self) -> &[String] {
        &self.depends
    }

    /// File name of the downloadable artifact.
    pub fn artifact_name(&self) -> String {
        Path::new(&self.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_{}_{}.deb", self.name, self.version, self.arch))
    }
}

/// A source of binary packages.
pub trait Repository {
    /// Stable identity used in cache keys.
    fn id(&self) -> &str;

    /// Look up a package by name. `Ok(None)` when this repository lacks it.
    fn find_package(&self, name: &str) -> Result<Option<Package>>;

    /// Download the artifact of `package` into the directory `location`.
    fn download(&self, package: &Package, location: &Path) -> Result<PathBuf>;
}

/// Repositories in priority order. The first one that knows a name wins.
#[derive(Default)]
pub struct RepositorySet {
    repos: Vec<Box<dyn Repository>>,
}

impl RepositorySet {
    pub fn new(repos: Vec<Box<dyn Repository>>) -> Self {
        Self { repos }
    }

    pub fn push(&mut self, repo: Box<dyn Repository>) {
        self.repos.push(repo);
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    /// Query repositories in order and return the first match.
    ///
    /// A repository that fails to answer is logged and treated as not
    /// having the package.
    pub fn find_package(&self, name: &str) -> Option<Package> {
        for repo in &self.repos {
            match repo.find_package(name) {
                Ok(Some(package)) => {
                    tracing::debug!(package = %name, repo = %repo.id(), "resolved");
                    return Some(package);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(package = %name, repo = %repo.id(), "lookup failed: {:#}", e);
                }
            }
        }
        None
    }

    /// Download through the repository that published `package`.
    pub fn download(&self, package: &Package, location: &Path) -> Result<PathBuf> {
        let repo = self
            .repos
            .iter()
            .find(|r| r.id() == package.repo)
            .with_context(|| format!("Repository '{}' is not configured", package.repo))?;
        repo.download(package, location)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryRepository;
    use super::*;

    #[test]
    fn test_first_repository_wins() {
        let set = RepositorySet::new(vec![
            Box::new(MemoryRepository::new("first").with("shared", &[])),
            Box::new(MemoryRepository::new("second").with("shared", &[]).with("only-second", &[])),
        ]);

        assert_eq!(set.find_package("shared").unwrap().repo, "first");
        assert_eq!(set.find_package("only-second").unwrap().repo, "second");
        assert!(set.find_package("missing").is_none());
    }

    #[test]
    fn test_download_routes_to_publishing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let first = MemoryRepository::new("first").with("a", &[]);
        let second = MemoryRepository::new("second").with("b", &[]);
        let second_downloads = second.downloads.clone();
        let set = RepositorySet::new(vec![Box::new(first), Box::new(second)]);

        let package = set.find_package("b").unwrap();
        let path = set.download(&package, dir.path()).unwrap();
        assert!(path.exists());
        assert_eq!(*second_downloads.borrow(), vec!["b".to_string()]);
    }

    #[test]
    fn test_artifact_name_from_filename() {
        let package = Package {
            name: "linux-image".to_string(),
            version: "6.1".to_string(),
            arch: "arm64".to_string(),
            repo: "r".to_string(),
            depends: vec![],
            filename: "pool/main/l/linux/linux-image_6.1_arm64.deb".to_string(),
            sha256: None,
        };
        assert_eq!(package.artifact_name(), "linux-image_6.1_arm64.deb");
        assert_eq!(package.id().to_string(), "linux-image:arm64 (r)");
    }
}
