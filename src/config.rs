//! Host-side configuration for bootgen.
//!
//! Reads settings from the environment. A `.env` file in the working
//! directory is loaded first (dotenvy); real environment variables win.
//! Command line flags override both.

use std::path::PathBuf;

use crate::scripts::ScriptPolicy;

/// Package cache root.
pub const ENV_CACHE_DIR: &str = "BOOTGEN_CACHE_DIR";
/// Any non-empty value other than `0`/`false` disables the package cache.
pub const ENV_NO_CACHE: &str = "BOOTGEN_NO_CACHE";
/// Any non-empty value other than `0`/`false` makes script failures fatal.
pub const ENV_STRICT_SCRIPTS: &str = "BOOTGEN_STRICT_SCRIPTS";
/// Parent directory of per-build staging trees.
pub const ENV_STAGING_DIR: &str = "BOOTGEN_STAGING_DIR";
/// Reproducible-builds timestamp applied to every archive entry.
pub const ENV_SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Bootgen configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where downloaded package artifacts are kept across builds
    pub cache_dir: PathBuf,
    /// Download straight into the staging tree instead of the cache
    pub use_cache: bool,
    /// Where per-build staging trees are created
    pub staging_root: PathBuf,
    pub script_policy: ScriptPolicy,
    /// mtime written into the archive
    pub source_date_epoch: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            use_cache: true,
            staging_root: std::env::temp_dir(),
            script_policy: ScriptPolicy::Lenient,
            source_date_epoch: 0,
        }
    }
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|s| !s.trim().is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_STAGING_DIR).filter(|s| !s.trim().is_empty()) {
            config.staging_root = PathBuf::from(dir);
        }
        if lookup(ENV_NO_CACHE).is_some_and(|v| is_truthy(&v)) {
            config.use_cache = false;
        }
        if lookup(ENV_STRICT_SCRIPTS).is_some_and(|v| is_truthy(&v)) {
            config.script_policy = ScriptPolicy::Strict;
        }
        if let Some(epoch) = lookup(ENV_SOURCE_DATE_EPOCH) {
            match epoch.trim().parse::<u64>() {
                Ok(value) => config.source_date_epoch = value,
                Err(_) => tracing::warn!(value = %epoch, "ignoring invalid SOURCE_DATE_EPOCH"),
            }
        }

        config
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        tracing::debug!(
            cache_dir = %self.cache_dir.display(),
            use_cache = self.use_cache,
            staging_root = %self.staging_root.display(),
            script_policy = ?self.script_policy,
            source_date_epoch = self.source_date_epoch,
            "configuration"
        );
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("bootgen").join("packages"))
        .unwrap_or_else(|| PathBuf::from("/tmp/bootgen-cache"))
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}
