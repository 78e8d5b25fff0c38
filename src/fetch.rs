//! Package fetch strategies.
//!
//! The pipeline is the same whether artifacts come straight from the
//! repository or through the persistent cache; only the [`PackageFetcher`]
//! differs.

use std::path::{Path, PathBuf};

use crate::cache::PackageCache;
use crate::error::{BuildError, Result};
use crate::repo::{Package, RepositorySet};

/// A fetched artifact ready for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    /// Delete the artifact once it has been extracted.
    pub transient: bool,
}

/// Strategy for getting a package artifact onto local disk.
pub trait PackageFetcher {
    fn fetch(
        &mut self,
        package: &Package,
        repos: &RepositorySet,
        package_dir: &Path,
    ) -> Result<FetchedArtifact>;
}

/// Downloads every artifact into the staging tree; nothing is kept.
#[derive(Debug, Default)]
pub struct DirectFetcher;

impl PackageFetcher for DirectFetcher {
    fn fetch(
        &mut self,
        package: &Package,
        repos: &RepositorySet,
        package_dir: &Path,
    ) -> Result<FetchedArtifact> {
        let path = repos
            .download(package, package_dir)
            .map_err(|source| BuildError::Fetch {
                package: package.name.clone(),
                source,
            })?;
        Ok(FetchedArtifact {
            path,
            transient: true,
        })
    }
}

/// Serves artifacts from a [`PackageCache`], downloading only on a miss.
#[derive(Debug)]
pub struct CachedFetcher {
    cache: PackageCache,
}

impl CachedFetcher {
    pub fn new(cache: PackageCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }
}

impl PackageFetcher for CachedFetcher {
    fn fetch(
        &mut self,
        package: &Package,
        repos: &RepositorySet,
        _package_dir: &Path,
    ) -> Result<FetchedArtifact> {
        let path = self.cache.fetch(package, repos)?;
        Ok(FetchedArtifact {
            path,
            transient: false,
        })
    }
}
