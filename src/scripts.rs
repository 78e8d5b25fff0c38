//! Post-processing scripts run against the assembled boot tree.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::fakeroot::{FakeRoot, FsOp};
use crate::process::Cmd;

/// What a failing script does to the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScriptPolicy {
    /// Log the failure and continue with the next script.
    #[default]
    Lenient,
    /// Abort the build with [`BuildError::Script`].
    Strict,
}

/// Run `scripts` in order with `target_dir` as their root.
///
/// Each script is copied into the tree under a unique hidden name, executed
/// from there and removed again, so it never ends up in the archive and
/// never replaces a placed path. Missing scripts are skipped.
/// Returns the number of scripts that ran successfully.
pub fn run_scripts(
    scripts: &[PathBuf],
    target_dir: &Path,
    shell: &mut FakeRoot,
    policy: ScriptPolicy,
) -> Result<usize> {
    let mut succeeded = 0;

    for script in scripts {
        if !script.is_file() {
            tracing::warn!(script = %script.display(), "script not found, skipping");
            continue;
        }

        let staged = tempfile::Builder::new()
            .prefix(".bootgen-script-")
            .tempfile_in(target_dir)
            .map_err(|e| BuildError::io(target_dir, e))?
            .into_temp_path();

        shell.run(&FsOp::copy(script, &*staged), target_dir, true)?;
        shell.run(&FsOp::chmod(&*staged, 0o755), target_dir, true)?;

        tracing::info!(script = %script.display(), "running script");
        let output = shell.run_in_root(Cmd::new(&*staged), target_dir, false)?;
        shell.run(&FsOp::remove(&*staged), target_dir, false)?;

        for line in output.stdout.lines() {
            tracing::debug!(script = %script.display(), "{}", line);
        }

        match output.error {
            None => succeeded += 1,
            Some(message) => match policy {
                ScriptPolicy::Lenient => {
                    tracing::warn!(script = %script.display(), "script failed: {}", message);
                }
                ScriptPolicy::Strict => {
                    tracing::error!(script = %script.display(), "script failed: {}", message);
                    return Err(BuildError::Script {
                        script: script.clone(),
                        message,
                    });
                }
            },
        }
    }

    Ok(succeeded)
}
