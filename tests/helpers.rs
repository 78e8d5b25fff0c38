//! Shared test utilities for bootgen integration tests.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use bootgen::config::Config;
use bootgen::scripts::ScriptPolicy;

/// Test environment with a scratch directory for repositories, manifests,
/// the package cache and build output.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub root: PathBuf,
    /// Where manifests and scripts are written
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Parent of the per-build staging trees
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();
        let config_dir = root.join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            cache_dir: root.join("cache"),
            staging_dir: root.join("staging"),
            output_dir: root.join("output"),
            config_dir,
            root,
            _temp_dir: temp_dir,
        }
    }

    /// Start a local APT-layout repository under `name`.
    pub fn repo(&self, name: &str) -> RepoBuilder {
        RepoBuilder::new(&self.root.join(name))
    }

    /// Write `boot.yaml` into the config directory.
    pub fn write_manifest(&self, yaml: &str) -> PathBuf {
        let path = self.config_dir.join("boot.yaml");
        fs::write(&path, yaml).expect("Failed to write manifest");
        path
    }

    /// Write an executable shell script next to the manifest.
    pub fn write_script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.config_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\nset -e\n{}\n", body)).expect("Failed to write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to make script executable");
        path
    }

    /// Configuration pointing at this environment's cache.
    pub fn config(&self, use_cache: bool) -> Config {
        Config {
            cache_dir: self.cache_dir.clone(),
            use_cache,
            staging_root: self.staging_dir.clone(),
            script_policy: ScriptPolicy::Lenient,
            source_date_epoch: 0,
        }
    }
}

/// Builds a repository with the layout
/// `dists/<distro>/<component>/binary-<arch>/Packages.gz` + `pool/`.
pub struct RepoBuilder {
    root: PathBuf,
    distro: String,
    component: String,
    arch: String,
    stanzas: Vec<String>,
}

impl RepoBuilder {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            distro: "ebcl".to_string(),
            component: "prod".to_string(),
            arch: "arm64".to_string(),
            stanzas: Vec::new(),
        }
    }

    /// Publish a package whose artifact is a `.tar.gz` holding `files`.
    pub fn package(
        mut self,
        name: &str,
        version: &str,
        depends: &[&str],
        files: &[(&str, &str)],
    ) -> Self {
        let filename = format!("pool/{}_{}_{}.tar.gz", name, version, self.arch);
        let artifact = build_tar_gz(files);
        let path = self.root.join(&filename);
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create pool");
        fs::write(&path, &artifact).expect("Failed to write artifact");

        let mut stanza = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\n",
            name, version, self.arch
        );
        if !depends.is_empty() {
            stanza.push_str(&format!("Depends: {}\n", depends.join(", ")));
        }
        stanza.push_str(&format!("Filename: {}\n", filename));
        stanza.push_str(&format!("SHA256: {}\n", hex::encode(Sha256::digest(&artifact))));
        self.stanzas.push(stanza);
        self
    }

    /// Write the index and return the repository root.
    pub fn build(self) -> PathBuf {
        let dir = self.root.join(format!(
            "dists/{}/{}/binary-{}",
            self.distro, self.component, self.arch
        ));
        fs::create_dir_all(&dir).expect("Failed to create dists dir");

        let index = self.stanzas.join("\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(index.as_bytes()).unwrap();
        fs::write(dir.join("Packages.gz"), encoder.finish().unwrap())
            .expect("Failed to write index");
        self.root
    }
}

fn build_tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .expect("Failed to append tar entry");
    }
    let tar = builder.into_inner().expect("Failed to finish tar");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// YAML block listing `repos` as `apt_repos`, in priority order.
pub fn apt_repos_yaml(repos: &[&Path]) -> String {
    let mut yaml = String::from("apt_repos:\n");
    for repo in repos {
        yaml.push_str(&format!(
            "  - apt_repo: {}\n    distro: ebcl\n    components:\n      - prod\n",
            repo.display()
        ));
    }
    yaml
}

/// One entry of a built archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub mtime: u64,
    pub is_dir: bool,
    pub data: Vec<u8>,
}

/// Read every entry of a tar archive.
pub fn read_archive(path: &Path) -> Vec<ArchiveEntry> {
    let file = fs::File::open(path).expect("Failed to open archive");
    let mut archive = tar::Archive::new(file);
    archive
        .entries()
        .expect("Failed to read archive")
        .map(|entry| {
            let mut entry = entry.expect("Corrupt archive entry");
            let header = entry.header().clone();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            ArchiveEntry {
                path: entry.path().unwrap().display().to_string(),
                uid: header.uid().unwrap(),
                gid: header.gid().unwrap(),
                mode: header.mode().unwrap() & 0o7777,
                mtime: header.mtime().unwrap(),
                is_dir: header.entry_type().is_dir(),
                data,
            }
        })
        .collect()
}

/// Find `path` in the archive or panic with the list of entries.
pub fn assert_entry<'a>(entries: &'a [ArchiveEntry], path: &str) -> &'a ArchiveEntry {
    entries.iter().find(|e| e.path == path).unwrap_or_else(|| {
        let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        panic!("{} not in archive: {:?}", path, names)
    })
}

pub fn assert_no_entry(entries: &[ArchiveEntry], path: &str) {
    assert!(
        entries.iter().all(|e| e.path != path),
        "{} unexpectedly in archive",
        path
    );
}
