//! Error taxonomy for boot partition builds.
//!
//! Fatal conditions surface as [`BuildError`]. Soft conditions (missing
//! placement sources, missing scripts) never become errors; they are logged
//! and the offending entry is skipped.

use std::path::PathBuf;
use thiserror::Error;

use crate::fakeroot::ShellError;

/// Errors that abort a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Manifest missing, unreadable, or carrying an invalid value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A requested or transitively required package matches no repository.
    #[error("package '{name}' was not found in any configured repository")]
    Resolution { name: String },

    #[error("failed to fetch package '{package}': {source:#}")]
    Fetch {
        package: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to extract {}: {source:#}", artifact.display())]
    Extract {
        artifact: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Shell(#[from] ShellError),

    /// Only raised under [`crate::scripts::ScriptPolicy::Strict`].
    #[error("script {} failed: {message}", script.display())]
    Script { script: PathBuf, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BuildError::Config(_) => 2,
            _ => 1,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
