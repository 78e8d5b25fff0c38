//! File placement: copies selected parts of the package tree into the boot
//! tree with the ownership and mode declared in the manifest.
//!
//! Missing sources are not errors. Manifests routinely list overlays that
//! only exist for some architectures or package sets, so an entry whose
//! source is absent is logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::common::absolutize;
use crate::error::{BuildError, Result};
use crate::fakeroot::{FakeRoot, FsOp};
use crate::manifest::FileEntry;

/// Outcome of a placement run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlacementSummary {
    /// Paths created in the target tree, in placement order
    pub placed: Vec<PathBuf>,
    /// Sources of entries that were skipped
    pub skipped: Vec<String>,
}

/// Apply `entries` in order, copying from `package_dir` into `target_dir`.
///
/// Later entries overwrite earlier ones at the same destination.
pub fn place(
    entries: &[FileEntry],
    package_dir: &Path,
    target_dir: &Path,
    shell: &mut FakeRoot,
) -> Result<PlacementSummary> {
    let mut summary = PlacementSummary::default();

    for entry in entries {
        let matches = expand_source(entry, package_dir, shell)?;
        if matches.is_empty() {
            summary.skipped.push(entry.source.clone());
            continue;
        }

        let destination = target_dir.join(entry.destination_path().map_err(BuildError::Config)?);
        shell.run(&FsOp::mkdir_p(&destination), target_dir, true)?;

        for source in matches {
            let placed = place_match(entry, &source, &destination, target_dir, shell)?;
            summary.placed.push(placed);
        }
    }

    tracing::info!(
        placed = summary.placed.len(),
        skipped = summary.skipped.len(),
        "file placement done"
    );
    Ok(summary)
}

/// Sources matched by `entry`, sorted. Empty means "skip this entry".
///
/// The parent directory is probed through the shell and the last path
/// segment is then expanded as a glob against it. Only the glob decides
/// whether anything exists; the literal pattern is never probed.
fn expand_source(
    entry: &FileEntry,
    package_dir: &Path,
    shell: &mut FakeRoot,
) -> Result<Vec<PathBuf>> {
    let source = absolutize(Path::new(entry.source.trim_start_matches('/')), package_dir);
    if !source.starts_with(package_dir) || source == package_dir {
        tracing::warn!(source = %entry.source, "source is outside the package tree, skipping");
        return Ok(Vec::new());
    }
    let (Some(parent), Some(pattern)) = (source.parent(), source.file_name()) else {
        return Ok(Vec::new());
    };

    let probe = shell.run(&FsOp::stat(parent), package_dir, false)?;
    if let Some(error) = probe.error {
        tracing::warn!(source = %entry.source, "source directory missing, skipping: {}", error);
        return Ok(Vec::new());
    }

    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&parent.to_string_lossy()),
        pattern.to_string_lossy()
    );
    let paths = match glob::glob(&full_pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(source = %entry.source, "invalid source pattern, skipping: {}", e);
            return Ok(Vec::new());
        }
    };

    let mut matches: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
    matches.sort();
    if matches.is_empty() {
        tracing::warn!(source = %entry.source, "source matches nothing, skipping");
    }
    Ok(matches)
}

fn place_match(
    entry: &FileEntry,
    source: &Path,
    destination: &Path,
    target_dir: &Path,
    shell: &mut FakeRoot,
) -> Result<PathBuf> {
    let meta = fs::symlink_metadata(source).map_err(|e| BuildError::io(source, e))?;
    let is_dir = meta.is_dir();
    let name = source
        .file_name()
        .ok_or_else(|| BuildError::Config(format!("cannot place '{}'", source.display())))?;
    let placed = destination.join(name);

    let copy = if is_dir {
        FsOp::copy_tree(source, destination)
    } else {
        FsOp::copy(source, destination)
    };
    shell.run(&copy, target_dir, true)?;
    // links are placed as links; their target may not exist in the boot tree
    if !meta.file_type().is_symlink() {
        shell.run(&FsOp::chmod(&placed, entry.mode.0), target_dir, true)?;
    }
    let chown = if is_dir {
        FsOp::chown_tree(&placed, entry.uid.0, entry.gid.0)
    } else {
        FsOp::chown(&placed, entry.uid.0, entry.gid.0)
    };
    shell.run(&chown, target_dir, true)?;

    tracing::debug!(
        source = %source.display(),
        placed = %placed.display(),
        mode = format_args!("{:o}", entry.mode.0),
        uid = entry.uid.0,
        gid = entry.gid.0,
        "placed"
    );
    Ok(placed)
}
