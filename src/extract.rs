//! Package artifact extraction into the shared package tree.
//!
//! Supported artifacts: Debian packages (`.deb`, via `dpkg-deb`) and plain
//! tarballs (`.tar`, `.tar.gz`/`.tgz`, `.tar.zst`). Every package of a build
//! lands in the same `package_dir`, later packages overwriting earlier ones.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::process::{which, Cmd};

/// Artifact formats we know how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Deb,
    Tar,
    TarGz,
    TarZst,
}

impl ArtifactKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".deb") || name.ends_with(".udeb") {
            Some(ArtifactKind::Deb)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArtifactKind::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(ArtifactKind::TarZst)
        } else if name.ends_with(".tar") {
            Some(ArtifactKind::Tar)
        } else {
            None
        }
    }
}

/// Unpack `artifact` into `location`.
pub fn extract_archive(artifact: &Path, location: &Path) -> Result<()> {
    let kind = ArtifactKind::detect(artifact)
        .with_context(|| format!("Unknown artifact format: {}", artifact.display()))?;

    fs::create_dir_all(location)
        .with_context(|| format!("Failed to create {}", location.display()))?;

    match kind {
        ArtifactKind::Deb => extract_deb(artifact, location)?,
        ArtifactKind::Tar => {
            let file = open(artifact)?;
            unpack_tar(file, location)?;
        }
        ArtifactKind::TarGz => {
            let file = open(artifact)?;
            unpack_tar(GzDecoder::new(file), location)?;
        }
        ArtifactKind::TarZst => {
            let file = open(artifact)?;
            let decoder = zstd::stream::read::Decoder::new(file)
                .context("Failed to initialize zstd decoder")?;
            unpack_tar(decoder, location)?;
        }
    }

    make_owner_writable(location)
}

fn open(path: &Path) -> Result<fs::File> {
    fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn unpack_tar<R: Read>(reader: R, location: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(location)
        .with_context(|| format!("Failed to unpack into {}", location.display()))
}

fn extract_deb(artifact: &Path, location: &Path) -> Result<()> {
    if which("dpkg-deb").is_none() {
        bail!(
            "dpkg-deb not found on PATH; it is required to unpack {}",
            artifact.display()
        );
    }
    Cmd::new("dpkg-deb")
        .arg("-x")
        .arg_path(artifact)
        .arg_path(location)
        .error_msg(format!("dpkg-deb failed to unpack {}", artifact.display()))
        .run()?;
    Ok(())
}

/// Packages ship read-only files and directories; later packages and the
/// placement stage still need to write next to them.
fn make_owner_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.path_is_symlink() {
            continue;
        }
        let metadata = entry.metadata()?;
        let mode = metadata.permissions().mode();
        let wanted = if metadata.is_dir() {
            mode | 0o700
        } else {
            mode | 0o600
        };
        if wanted != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(wanted))
                .with_context(|| {
                    format!("Failed to fix permissions of {}", entry.path().display())
                })?;
        }
    }
    Ok(())
}

/// Extracts each artifact at most once per build.
#[derive(Debug, Default)]
pub struct ArtifactExtractor {
    extracted: HashSet<PathBuf>,
}

impl ArtifactExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack `artifact` into `package_dir`. Returns false if it was
    /// already extracted during this build.
    pub fn extract(&mut self, artifact: &Path, package_dir: &Path) -> Result<bool, BuildError> {
        if self.extracted.contains(artifact) {
            tracing::debug!(artifact = %artifact.display(), "already extracted");
            return Ok(false);
        }
        tracing::info!(artifact = %artifact.display(), "extracting");
        extract_archive(artifact, package_dir).map_err(|source| BuildError::Extract {
            artifact: artifact.to_path_buf(),
            source,
        })?;
        self.extracted.insert(artifact.to_path_buf());
        Ok(true)
    }
}
