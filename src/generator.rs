//! Boot partition build pipeline.
//!
//! Resolve → fetch + extract → place files → run scripts → pack.
//! Every stage finishes before the next one starts. A [`BootGenerator`]
//! runs one build at a time; concurrent builds use separate generators
//! (and separate processes) and never share staging trees.

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::pack;
use crate::cache::PackageCache;
use crate::common::{absolutize, cleanup_staging_dir, cleanup_work_dir, staging_dir};
use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::extract::ArtifactExtractor;
use crate::fakeroot::{FakeRoot, FsOp};
use crate::fetch::{CachedFetcher, DirectFetcher, PackageFetcher};
use crate::manifest::Manifest;
use crate::placement::place;
use crate::repo::apt::AptRepository;
use crate::repo::{Package, Repository, RepositorySet};
use crate::resolve::Resolver;
use crate::scripts::run_scripts;
use crate::timing::Timer;

/// Everything a build reads. Never mutated once constructed.
pub struct BuildContext {
    pub manifest: Manifest,
    pub config: Config,
    pub repos: RepositorySet,
}

impl BuildContext {
    /// Build a context whose repositories come from the manifest.
    pub fn new(manifest: Manifest, config: Config) -> Result<Self> {
        let mut repos = RepositorySet::default();
        for descriptor in manifest.repositories() {
            let repo = AptRepository::new(&descriptor, &manifest.arch).map_err(|e| {
                BuildError::Config(format!("repository {}: {:#}", descriptor.apt_repo, e))
            })?;
            tracing::debug!(repo = %repo.id(), "repository configured");
            repos.push(Box::new(repo));
        }
        Ok(Self::with_repositories(manifest, config, repos))
    }

    /// Build a context around an existing repository set.
    pub fn with_repositories(manifest: Manifest, config: Config, repos: RepositorySet) -> Self {
        Self {
            manifest,
            config,
            repos,
        }
    }
}

/// Drives a boot partition build.
pub struct BootGenerator {
    ctx: BuildContext,
    fetcher: Box<dyn PackageFetcher>,
}

impl BootGenerator {
    /// Create a generator with the fetch strategy the configuration selects.
    pub fn new(ctx: BuildContext) -> Result<Self> {
        let fetcher: Box<dyn PackageFetcher> = if ctx.config.use_cache {
            let cache = PackageCache::open(&ctx.config.cache_dir)?;
            tracing::debug!(cache = %cache.root().display(), "using package cache");
            Box::new(CachedFetcher::new(cache))
        } else {
            tracing::debug!("package cache disabled");
            Box::new(DirectFetcher)
        };
        Ok(Self::with_fetcher(ctx, fetcher))
    }

    pub fn with_fetcher(ctx: BuildContext, fetcher: Box<dyn PackageFetcher>) -> Self {
        Self { ctx, fetcher }
    }

    /// Build the boot archive into `output_dir` and return its path.
    ///
    /// Staging trees are removed whether the build succeeds or fails.
    pub fn create_boot(&mut self, output_dir: &Path) -> Result<PathBuf> {
        let cwd = std::env::current_dir().map_err(|e| BuildError::io(".", e))?;
        let output_dir = absolutize(output_dir, &cwd);
        let manifest = &self.ctx.manifest;

        let timer = Timer::start("resolve packages");
        let packages = Resolver::new(&self.ctx.repos, manifest.download_deps)
            .resolve(manifest.packages.iter().cloned())?;
        timer.finish();

        let staging = staging_dir(&self.ctx.config.staging_root, "bootgen-")?;
        let package_dir = staging.path().join("packages");
        let target_dir = staging.path().join("target");
        fs::create_dir_all(&package_dir).map_err(|e| BuildError::io(&package_dir, e))?;

        let mut shell = FakeRoot::new().with_source_date_epoch(self.ctx.config.source_date_epoch);
        shell.run(&FsOp::mkdir_p(&target_dir), staging.path(), true)?;
        shell.run(&FsOp::chmod(&target_dir, 0o755), staging.path(), true)?;

        let timer = Timer::start("fetch and extract packages");
        fetch_and_extract(self.fetcher.as_mut(), &self.ctx.repos, &packages, &package_dir)?;
        timer.finish();

        let timer = Timer::start("place files");
        place(&manifest.files, &package_dir, &target_dir, &mut shell)?;
        cleanup_work_dir(&package_dir);
        timer.finish();

        let timer = Timer::start("run scripts");
        run_scripts(
            &manifest.script_paths(),
            &target_dir,
            &mut shell,
            self.ctx.config.script_policy,
        )?;
        timer.finish();

        let timer = Timer::start("pack archive");
        let archive = pack(&mut shell, &target_dir, &manifest.archive_name, &output_dir)?;
        timer.finish();

        cleanup_staging_dir(staging)?;
        tracing::info!(archive = %archive.display(), "boot partition created");
        Ok(archive)
    }
}

fn fetch_and_extract(
    fetcher: &mut dyn PackageFetcher,
    repos: &RepositorySet,
    packages: &[Package],
    package_dir: &Path,
) -> Result<()> {
    let mut extractor = ArtifactExtractor::new();
    for package in packages {
        tracing::info!(package = %package.name, version = %package.version, "fetching");
        let artifact = fetcher.fetch(package, repos, package_dir)?;
        extractor.extract(&artifact.path, package_dir)?;
        if artifact.transient {
            fs::remove_file(&artifact.path).map_err(|e| BuildError::io(&artifact.path, e))?;
        }
    }
    Ok(())
}
