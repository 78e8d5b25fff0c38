//! bootgen - embedded Linux boot partition generator.
//!
//! Reads a YAML manifest, resolves its packages against APT repositories,
//! stages the selected files under emulated ownership and packs the result
//! into a deterministic tar archive.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use bootgen::cache::PackageCache;
use bootgen::config::Config;
use bootgen::error::BuildError;
use bootgen::generator::{BootGenerator, BuildContext};
use bootgen::manifest::Manifest;
use bootgen::scripts::ScriptPolicy;

#[derive(Parser)]
#[command(name = "bootgen")]
#[command(about = "Build an embedded Linux boot partition archive from a manifest")]
#[command(
    after_help = concat!(
        "ENVIRONMENT:\n",
        "  BOOTGEN_CACHE_DIR       Package cache root\n",
        "  BOOTGEN_NO_CACHE        Download straight into the staging tree\n",
        "  BOOTGEN_STAGING_DIR     Parent of per-build staging trees\n",
        "  BOOTGEN_STRICT_SCRIPTS  Failing scripts abort the build\n",
        "  SOURCE_DATE_EPOCH       mtime of every archive entry\n",
        "  RUST_LOG                Log filter (overrides -v)"
    )
)]
struct Cli {
    /// Manifest (YAML) describing packages, files and scripts
    config_file: PathBuf,

    /// Directory receiving the archive (created if missing)
    output_dir: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Package cache root
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Do not use the package cache
    #[arg(long)]
    no_cache: bool,

    /// Empty the package cache before building
    #[arg(long, conflicts_with = "no_cache")]
    clear_cache: bool,

    /// Abort the build when a script fails
    #[arg(long)]
    strict_scripts: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(archive) => {
            println!("{}", archive.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> Result<PathBuf, BuildError> {
    let mut config = Config::load();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if cli.no_cache {
        config.use_cache = false;
    }
    if cli.strict_scripts {
        config.script_policy = ScriptPolicy::Strict;
    }
    config.log();

    let manifest = Manifest::load(&cli.config_file)?;
    tracing::info!(
        manifest = %cli.config_file.display(),
        packages = manifest.packages.len(),
        files = manifest.files.len(),
        scripts = manifest.scripts.len(),
        arch = %manifest.arch,
        "manifest loaded"
    );

    if cli.clear_cache {
        PackageCache::open(&config.cache_dir)?.clear()?;
        tracing::info!(cache = %config.cache_dir.display(), "package cache cleared");
    }

    let ctx = BuildContext::new(manifest, config)?;
    BootGenerator::new(ctx)?.create_boot(&cli.output_dir)
}
