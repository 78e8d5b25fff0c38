//! Blocking downloads for repository indexes and package artifacts.
//!
//! A location is either an HTTP(S) URL or a local path (`file://` URLs and
//! bare paths). Everything is sequential; a slow server blocks the build.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download retry configuration.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Retry attempts for transient failures
    pub retries: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Where a repository file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Http(String),
    Local(PathBuf),
}

impl Location {
    /// Parse a repository base location.
    pub fn parse(base: &str) -> Self {
        let base = base.trim();
        if base.starts_with("http://") || base.starts_with("https://") {
            Location::Http(base.trim_end_matches('/').to_string())
        } else if let Some(path) = base.strip_prefix("file://") {
            Location::Local(PathBuf::from(path))
        } else {
            Location::Local(PathBuf::from(base))
        }
    }

    /// Append a `/`-separated relative path.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        match self {
            Location::Http(url) => Location::Http(format!("{}/{}", url, relative)),
            Location::Local(path) => Location::Local(path.join(relative)),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Http(url) => f.write_str(url),
            Location::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Fetches repository files over HTTP or from the local filesystem.
pub struct Downloader {
    client: reqwest::blocking::Client,
    options: DownloadOptions,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("bootgen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, options })
    }

    /// Read a file fully into memory. `Ok(None)` when it does not exist.
    pub fn fetch_optional(&self, location: &Location) -> Result<Option<Vec<u8>>> {
        match location {
            Location::Local(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                fs::read(path)
                    .map(Some)
                    .with_context(|| format!("Failed to read {}", path.display()))
            }
            Location::Http(url) => self.with_retries(url, || {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .with_context(|| format!("HTTP request failed: {}", url))?;
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    bail!("HTTP {} for {}", status.as_u16(), url);
                }
                let bytes = response
                    .bytes()
                    .with_context(|| format!("Failed to read body of {}", url))?;
                Ok(Some(bytes.to_vec()))
            }),
        }
    }

    /// Download `location` to `dest`, verifying `expected_sha256` if given.
    ///
    /// The file is written under a `.part` name and renamed on success; on
    /// any failure nothing is left at `dest`.
    pub fn download_to(
        &self,
        location: &Location,
        dest: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        let bytes = self
            .fetch_optional(location)?
            .with_context(|| format!("{} does not exist", location))?;

        if let Some(expected) = expected_sha256 {
            verify_sha256(&bytes, expected).with_context(|| format!("Verifying {}", location))?;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let partial = partial_path(dest);
        let written = fs::File::create(&partial)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .with_context(|| format!("Failed to write {}", partial.display()));
        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, dest)
            .with_context(|| format!("Failed to move download into {}", dest.display()))?;

        tracing::debug!(
            source = %location,
            dest = %dest.display(),
            size = bytes.len(),
            "downloaded"
        );
        Ok(())
    }

    fn with_retries<T>(&self, url: &str, mut attempt_fn: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match attempt_fn() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.options.retries && is_retryable_error(&e) => {
                    let delay = self.options.retry_delay * (1 << attempt.min(4));
                    attempt += 1;
                    tracing::warn!(
                        url = %url,
                        attempt,
                        retries = self.options.retries,
                        error = %e,
                        "download failed, retrying in {:?}",
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Connection problems and 5xx responses are worth another attempt.
fn is_retryable_error(error: &anyhow::Error) -> bool {
    if let Some(req) = error.downcast_ref::<reqwest::Error>() {
        return req.is_timeout() || req.is_connect() || req.is_request() || req.is_body();
    }
    let msg = error.to_string();
    msg.starts_with("HTTP 5")
}

/// Compare the sha256 of `bytes` against a hex digest.
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "Checksum mismatch!\n  Expected: {}\n  Got: {}",
            expected.trim(),
            actual
        );
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
