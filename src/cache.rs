//! Persistent package cache.
//!
//! Downloaded artifacts are kept across builds, keyed by package identity
//! (name, architecture, repository):
//!
//! ```text
//! <root>/<repo-key>/<arch>/<name>/entry.json
//! <root>/<repo-key>/<arch>/<name>/<artifact>
//! ```
//!
//! An entry is created in a staging directory inside `<root>` and renamed
//! into place once complete, so a partial download is never seen as a hit.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::download::sha256_hex;
use crate::error::{BuildError, Result};
use crate::repo::{Package, PackageId, RepositorySet};

const ENTRY_FILE: &str = "entry.json";

/// Metadata stored next to a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub repo: String,
    /// Artifact file name inside the entry directory
    pub file: String,
    pub sha256: Option<String>,
}

/// Package artifact cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    /// Open (and create if needed) a cache at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| BuildError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for `id`.
    pub fn entry_dir(&self, id: &PackageId) -> PathBuf {
        let repo_key = &sha256_hex(id.repo.as_bytes())[..16];
        self.root
            .join(repo_key)
            .join(sanitize(&id.arch))
            .join(sanitize(&id.name))
    }

    /// Cached artifact for `package`, if a complete entry of the same
    /// version exists.
    pub fn lookup(&self, package: &Package) -> Option<PathBuf> {
        let dir = self.entry_dir(&package.id());
        let entry = read_entry(&dir)?;
        if entry.version != package.version {
            tracing::debug!(
                package = %package.name,
                cached = %entry.version,
                wanted = %package.version,
                "cached version is stale"
            );
            return None;
        }
        let artifact = dir.join(&entry.file);
        artifact.is_file().then_some(artifact)
    }

    /// Return the cached artifact for `package`, downloading it on a miss.
    pub fn fetch(&self, package: &Package, repos: &RepositorySet) -> Result<PathBuf> {
        if let Some(path) = self.lookup(package) {
            tracing::info!(package = %package.name, path = %path.display(), "cache hit");
            return Ok(path);
        }

        tracing::info!(package = %package.name, version = %package.version, "cache miss");
        let entry_dir = self.entry_dir(&package.id());
        let stage = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|e| BuildError::io(&self.root, e))?;

        let artifact = repos
            .download(package, stage.path())
            .map_err(|source| BuildError::Fetch {
                package: package.name.clone(),
                source,
            })?;
        let file = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| package.artifact_name());

        let entry = CacheEntry {
            name: package.name.clone(),
            version: package.version.clone(),
            arch: package.arch.clone(),
            repo: package.repo.clone(),
            file,
            sha256: package.sha256.clone(),
        };
        write_entry(stage.path(), &entry).map_err(|source| BuildError::Fetch {
            package: package.name.clone(),
            source,
        })?;

        self.commit(stage.path(), &entry_dir, &entry)
    }

    /// Move a finished staging directory into place and return the
    /// artifact path.
    ///
    /// An entry of the same version that is already in place wins; the
    /// stage is discarded and the existing artifact returned.
    fn commit(&self, stage: &Path, entry_dir: &Path, entry: &CacheEntry) -> Result<PathBuf> {
        if let Some(parent) = entry_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        if let Some(existing) = committed(entry_dir, &entry.version) {
            tracing::debug!(package = %entry.name, "entry committed by another build");
            return Ok(existing);
        }
        if entry_dir.exists() {
            // stale version or an incomplete leftover
            fs::remove_dir_all(entry_dir).map_err(|e| BuildError::io(entry_dir, e))?;
        }
        match fs::rename(stage, entry_dir) {
            Ok(()) => Ok(entry_dir.join(&entry.file)),
            // another build committed the same entry first
            Err(e) => committed(entry_dir, &entry.version)
                .ok_or_else(|| BuildError::io(entry_dir, e)),
        }
    }

    /// Remove every cached entry.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| BuildError::io(&self.root, e))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| BuildError::io(&self.root, e))
    }
}

fn read_entry(dir: &Path) -> Option<CacheEntry> {
    let path = dir.join(ENTRY_FILE);
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring corrupt cache entry: {}", e);
            None
        }
    }
}

/// Artifact of a complete entry of `version` in `dir`.
fn committed(dir: &Path, version: &str) -> Option<PathBuf> {
    let entry = read_entry(dir)?;
    let artifact = dir.join(&entry.file);
    (entry.version == version && artifact.is_file()).then_some(artifact)
}

fn write_entry(dir: &Path, entry: &CacheEntry) -> anyhow::Result<()> {
    let path = dir.join(ENTRY_FILE);
    let json = serde_json::to_string_pretty(entry)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Keep a path component free of separators.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
