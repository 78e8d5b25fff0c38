//! APT-layout repositories.
//!
//! Indexes are read from `<url>/dists/<distro>/<component>/binary-<arch>/Packages.gz`
//! (falling back to the uncompressed `Packages`). Only the handful of stanza
//! fields needed for dependency resolution and download are interpreted.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use once_cell::unsync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{Package, Repository};
use crate::download::{DownloadOptions, Downloader, Location};
use crate::manifest::RepoDescriptor;

/// One APT repository (url + distribution + components) for one architecture.
pub struct AptRepository {
    id: String,
    base: Location,
    distro: String,
    components: Vec<String>,
    arch: String,
    downloader: Downloader,
    index: OnceCell<HashMap<String, Package>>,
}

impl AptRepository {
    pub fn new(descriptor: &RepoDescriptor, default_arch: &str) -> Result<Self> {
        let arch = descriptor
            .arch
            .clone()
            .unwrap_or_else(|| default_arch.to_string());
        Ok(Self {
            id: format!("{}#{}", descriptor.apt_repo.trim_end_matches('/'), descriptor.distro),
            base: Location::parse(&descriptor.apt_repo),
            distro: descriptor.distro.clone(),
            components: descriptor.components.clone(),
            arch,
            downloader: Downloader::new(DownloadOptions::default())?,
            index: OnceCell::new(),
        })
    }

    fn index(&self) -> Result<&HashMap<String, Package>> {
        self.index.get_or_try_init(|| self.load_index())
    }

    fn load_index(&self) -> Result<HashMap<String, Package>> {
        let mut index = HashMap::new();
        for component in &self.components {
            let dir = format!(
                "dists/{}/{}/binary-{}",
                self.distro, component, self.arch
            );
            let Some(text) = self.read_component_index(&dir)? else {
                tracing::debug!(repo = %self.id, component = %component, "no package index");
                continue;
            };
            for package in parse_packages_index(&text, &self.arch, &self.id) {
                index.entry(package.name.clone()).or_insert(package);
            }
        }
        tracing::info!(
            repo = %self.id,
            arch = %self.arch,
            packages = index.len(),
            "loaded package index"
        );
        Ok(index)
    }

    fn read_component_index(&self, dir: &str) -> Result<Option<String>> {
        let gz = self.base.join(&format!("{}/Packages.gz", dir));
        if let Some(bytes) = self.downloader.fetch_optional(&gz)? {
            let mut text = String::new();
            GzDecoder::new(bytes.as_slice())
                .read_to_string(&mut text)
                .with_context(|| format!("Failed to decompress {}", gz))?;
            return Ok(Some(text));
        }

        let plain = self.base.join(&format!("{}/Packages", dir));
        match self.downloader.fetch_optional(&plain)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }
}

impl Repository for AptRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn find_package(&self, name: &str) -> Result<Option<Package>> {
        Ok(self.index()?.get(name).cloned())
    }

    fn download(&self, package: &Package, location: &Path) -> Result<PathBuf> {
        let dest = location.join(package.artifact_name());
        let source = self.base.join(&package.filename);
        tracing::info!(
            package = %package.name,
            version = %package.version,
            source = %source,
            "downloading"
        );
        self.downloader
            .download_to(&source, &dest, package.sha256.as_deref())
            .with_context(|| format!("Failed to download {}", package.name))?;
        Ok(dest)
    }
}

/// Parse a Debian `Packages` index into packages for `arch`.
///
/// Packages for `all` are accepted for every architecture. The first stanza
/// of a given name wins.
pub fn parse_packages_index(text: &str, arch: &str, repo_id: &str) -> Vec<Package> {
    let mut packages: Vec<Package> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for stanza in text.split("\n\n") {
        let fields = parse_stanza(stanza);
        let (Some(name), Some(filename)) = (fields.get("Package"), fields.get("Filename")) else {
            continue;
        };
        let pkg_arch = fields.get("Architecture").map(String::as_str).unwrap_or(arch);
        if pkg_arch != arch && pkg_arch != "all" {
            continue;
        }
        if !seen.insert(name.clone()) {
            continue;
        }

        let mut depends = Vec::new();
        for key in ["Pre-Depends", "Depends"] {
            if let Some(value) = fields.get(key) {
                for dep in parse_depends(value) {
                    if !depends.contains(&dep) {
                        depends.push(dep);
                    }
                }
            }
        }

        packages.push(Package {
            name: name.clone(),
            version: fields.get("Version").cloned().unwrap_or_default(),
            arch: pkg_arch.to_string(),
            repo: repo_id.to_string(),
            depends,
            filename: filename.clone(),
            sha256: fields.get("SHA256").cloned(),
        });
    }

    packages
}

fn parse_stanza(stanza: &str) -> HashMap<String, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for line in stanza.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of a multi-line field
            if let Some(key) = &current {
                if let Some(value) = fields.get_mut(key) {
                    value.push('\n');
                    value.push_str(line.trim());
                }
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            fields.insert(key.clone(), value.trim().to_string());
            current = Some(key);
        }
    }
    fields
}

/// `libc6 (>= 2.34), foo | bar, baz:any` -> `[libc6, foo, baz]`
pub fn parse_depends(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|group| {
            let first = group.split('|').next()?.trim();
            let name = first
                .split(|c: char| c.is_whitespace() || c == '(' || c == '[' || c == '<')
                .next()?
                .split(':')
                .next()?
                .trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;

    const INDEX: &str = "\
Package: base-files
Version: 12.4
Architecture: arm64
Depends: libc6 (>= 2.34), mawk | awk
Filename: pool/main/b/base-files/base-files_12.4_arm64.deb
SHA256: abc123
Description: base files
 continued description line

Package: tzdata
Version: 2024a
Architecture: all
Filename: pool/main/t/tzdata/tzdata_2024a_all.deb

Package: amd64-only
Version: 1
Architecture: amd64
Filename: pool/main/a/amd64-only_1_amd64.deb

Package: base-files
Version: 11
Architecture: arm64
Filename: pool/main/b/base-files/base-files_11_arm64.deb
";

    #[test]
    fn test_parse_depends_strips_constraints() {
        assert_eq!(
            parse_depends("libc6 (>= 2.34), foo | bar, baz:any, qux [arm64], quux <!nocheck>"),
            vec!["libc6", "foo", "baz", "qux", "quux"]
        );
        assert!(parse_depends("").is_empty());
    }

    #[test]
    fn test_parse_stanza_joins_continuation_lines() {
        let stanza = "Package: base-files\nDescription: base files\n continued description line\n";
        let fields = parse_stanza(stanza);
        assert_eq!(fields["Package"], "base-files");
        assert_eq!(fields["Description"], "base files\ncontinued description line");
    }

    #[test]
    fn test_parse_index_filters_arch_and_keeps_first() {
        let packages = parse_packages_index(INDEX, "arm64", "repo");
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["base-files", "tzdata"]);

        let base = &packages[0];
        assert_eq!(base.version, "12.4");
        assert_eq!(base.depends, vec!["libc6", "mawk"]);
        assert_eq!(base.sha256.as_deref(), Some("abc123"));
        assert_eq!(base.repo, "repo");
        assert_eq!(packages[1].arch, "all");
    }

    #[test]
    fn test_local_repository_reads_gz_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("dists/stable/main/binary-arm64");
        fs::create_dir_all(&index_dir).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(INDEX.as_bytes()).unwrap();
        fs::write(index_dir.join("Packages.gz"), encoder.finish().unwrap()).unwrap();

        let descriptor = RepoDescriptor {
            apt_repo: dir.path().display().to_string(),
            distro: "stable".to_string(),
            components: vec!["main".to_string(), "missing".to_string()],
            arch: None,
        };
        let repo = AptRepository::new(&descriptor, "arm64").unwrap();

        let package = repo.find_package("tzdata").unwrap().unwrap();
        assert_eq!(package.repo, repo.id());
        assert!(repo.find_package("amd64-only").unwrap().is_none());
    }

    #[test]
    fn test_local_repository_download() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("dists/stable/main/binary-arm64");
        fs::create_dir_all(&index_dir).unwrap();
        fs::create_dir_all(dir.path().join("pool")).unwrap();
        fs::write(dir.path().join("pool/hello_1_arm64.tar"), b"artifact").unwrap();
        fs::write(
            index_dir.join("Packages"),
            "Package: hello\nVersion: 1\nArchitecture: arm64\nFilename: pool/hello_1_arm64.tar\n",
        )
        .unwrap();

        let descriptor = RepoDescriptor {
            apt_repo: format!("file://{}", dir.path().display()),
            distro: "stable".to_string(),
            components: vec!["main".to_string()],
            arch: Some("arm64".to_string()),
        };
        let repo = AptRepository::new(&descriptor, "amd64").unwrap();
        let package = repo.find_package("hello").unwrap().unwrap();

        let out = tempfile::tempdir().unwrap();
        let path = repo.download(&package, out.path()).unwrap();
        assert_eq!(path, out.path().join("hello_1_arm64.tar"));
        assert_eq!(fs::read(path).unwrap(), b"artifact");
    }
}
