//! Boot manifest: the declarative description of one boot partition build.
//!
//! ```yaml
//! arch: arm64
//! archive_name: boot.tar
//! download_deps: true
//! apt_repos:
//!   - apt_repo: https://linux.elektrobit.com/eb-corbos-linux/1.2
//!     distro: ebcl
//!     components: [prod, dev]
//! packages:
//!   - linux-image-generic
//! files:
//!   - source: boot/vmlinuz*
//!     destination: ""
//!     mode: 644
//! scripts:
//!   - config_boot.sh
//! ```

use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{BuildError, Result};

/// Repository used when the manifest carries no `apt_repos`.
pub const DEFAULT_APT_REPO: &str = "https://linux.elektrobit.com/eb-corbos-linux/1.2";
pub const DEFAULT_DISTRO: &str = "ebcl";
pub const DEFAULT_COMPONENTS: &[&str] = &["prod", "dev"];
pub const DEFAULT_ARCH: &str = "arm64";
pub const DEFAULT_ARCHIVE_NAME: &str = "boot.tar";
/// Mode applied to placed files when the entry does not declare one.
pub const DEFAULT_MODE: u32 = 0o600;

/// Parsed boot manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default, deserialize_with = "null_as_default")]
    pub packages: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileEntry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub scripts: Vec<PathBuf>,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub apt_repos: Option<Vec<RepoDescriptor>>,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    #[serde(default = "default_true")]
    pub download_deps: bool,
    /// Directory holding the manifest; scripts resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// One APT-style repository, in manifest priority order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoDescriptor {
    #[serde(alias = "url")]
    pub apt_repo: String,
    pub distro: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub components: Vec<String>,
    /// Overrides the manifest architecture for this repository.
    #[serde(default)]
    pub arch: Option<String>,
}

/// File-placement entry: copy `source` (glob on its last segment) from the
/// package tree into `destination` of the boot tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub uid: Id,
    #[serde(default)]
    pub gid: Id,
}

/// Permission bits, written in the manifest as octal digits (`644`, `"0755"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawValue")]
pub struct Mode(pub u32);

/// Numeric user or group id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawValue")]
pub struct Id(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Int(u64),
    Str(String),
}

impl Default for Mode {
    fn default() -> Self {
        Mode(DEFAULT_MODE)
    }
}

impl TryFrom<RawValue> for Mode {
    type Error = String;

    fn try_from(raw: RawValue) -> std::result::Result<Self, Self::Error> {
        // YAML reads `644` as a decimal integer; its digits are the octal mode.
        let digits = match raw {
            RawValue::Int(n) => n.to_string(),
            RawValue::Str(s) => s.trim().trim_start_matches("0o").to_string(),
        };
        parse_octal_mode(&digits).map(Mode)
    }
}

impl TryFrom<RawValue> for Id {
    type Error = String;

    fn try_from(raw: RawValue) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawValue::Int(n) => u32::try_from(n)
                .map(Id)
                .map_err(|_| format!("id {} out of range", n)),
            RawValue::Str(s) => s
                .trim()
                .parse::<u32>()
                .map(Id)
                .map_err(|_| format!("invalid numeric id '{}'", s)),
        }
    }
}

fn parse_octal_mode(digits: &str) -> std::result::Result<u32, String> {
    if digits.is_empty() {
        return Err("empty mode".to_string());
    }
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| format!("mode '{}' is not an octal number", digits))?;
    if mode > 0o7777 {
        return Err(format!("mode '{}' exceeds 7777", digits));
    }
    Ok(mode)
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_arch() -> String {
    DEFAULT_ARCH.to_string()
}

fn default_archive_name() -> String {
    DEFAULT_ARCHIVE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("cannot read manifest {}: {}", path.display(), e))
        })?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut manifest = Self::from_yaml(&content)
            .map_err(|e| BuildError::Config(format!("{}: {}", path.display(), e)))?;
        manifest.base_dir = if base_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base_dir
        };
        Ok(manifest)
    }

    /// Parse and validate manifest text. `base_dir` is left as `.`.
    pub fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Err("manifest is empty".to_string());
        }
        let mut manifest: Manifest = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        manifest.base_dir = PathBuf::from(".");
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.archive_name.trim().is_empty() {
            return Err("archive_name must not be empty".to_string());
        }
        if self.archive_name.contains('/')
            || self.archive_name == "."
            || self.archive_name == ".."
        {
            return Err(format!(
                "archive_name '{}' must be a plain file name",
                self.archive_name
            ));
        }
        if self.arch.trim().is_empty() {
            return Err("arch must not be empty".to_string());
        }
        for entry in &self.files {
            if entry.source.trim().is_empty() {
                return Err("file entry with empty source".to_string());
            }
            entry.destination_path()?;
        }
        if let Some(repos) = &self.apt_repos {
            for repo in repos {
                if repo.apt_repo.trim().is_empty() || repo.distro.trim().is_empty() {
                    return Err("apt_repos entries need apt_repo and distro".to_string());
                }
            }
        }
        Ok(())
    }

    /// Repositories in priority order, defaults applied.
    pub fn repositories(&self) -> Vec<RepoDescriptor> {
        match &self.apt_repos {
            Some(repos) => repos
                .iter()
                .map(|r| RepoDescriptor {
                    arch: Some(r.arch.clone().unwrap_or_else(|| self.arch.clone())),
                    ..r.clone()
                })
                .collect(),
            None => vec![RepoDescriptor {
                apt_repo: DEFAULT_APT_REPO.to_string(),
                distro: DEFAULT_DISTRO.to_string(),
                components: DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect(),
                arch: Some(self.arch.clone()),
            }],
        }
    }

    /// Script paths resolved against the manifest directory.
    pub fn script_paths(&self) -> Vec<PathBuf> {
        self.scripts.iter().map(|s| self.base_dir.join(s)).collect()
    }
}

impl FileEntry {
    /// Destination relative to the boot tree root. Empty or `/` means the root.
    pub fn destination_path(&self) -> std::result::Result<PathBuf, String> {
        let raw = self.destination.as_deref().unwrap_or("");
        let mut out = PathBuf::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(format!("destination '{}' leaves the boot tree", raw));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let manifest = Manifest::from_yaml("packages: [base-files]\n").unwrap();
        assert_eq!(manifest.arch, "arm64");
        assert_eq!(manifest.archive_name, "boot.tar");
        assert!(manifest.download_deps);
        assert!(manifest.files.is_empty());
        assert!(manifest.scripts.is_empty());

        let repos = manifest.repositories();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].apt_repo, DEFAULT_APT_REPO);
        assert_eq!(repos[0].components, vec!["prod", "dev"]);
        assert_eq!(repos[0].arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn test_null_lists_are_empty() {
        let manifest = Manifest::from_yaml("packages:\nfiles:\nscripts:\napt_repos:\n").unwrap();
        assert!(manifest.packages.is_empty());
        assert!(manifest.apt_repos.is_none());
    }

    #[test]
    fn test_file_entry_defaults() {
        let yaml = "files:\n  - source: etc/hostname\n";
        let manifest = Manifest::from_yaml(yaml).unwrap();
        let entry = &manifest.files[0];
        assert_eq!(entry.mode, Mode(0o600));
        assert_eq!(entry.uid, Id(0));
        assert_eq!(entry.gid, Id(0));
        assert_eq!(entry.destination_path().unwrap(), PathBuf::new());
    }

    #[test]
    fn test_mode_integer_and_string_are_octal() {
        let yaml = r#"
files:
  - source: a
    mode: 644
    uid: 1000
    gid: "1000"
  - source: b
    mode: "0755"
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.files[0].mode, Mode(0o644));
        assert_eq!(manifest.files[0].uid, Id(1000));
        assert_eq!(manifest.files[0].gid, Id(1000));
        assert_eq!(manifest.files[1].mode, Mode(0o755));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let err = Manifest::from_yaml("files:\n  - source: a\n    mode: 698\n").unwrap_err();
        assert!(err.contains("698"), "{}", err);
    }

    #[test]
    fn test_destination_normalized() {
        let entry = FileEntry {
            source: "etc/hostname".to_string(),
            destination: Some("/".to_string()),
            mode: Mode::default(),
            uid: Id::default(),
            gid: Id::default(),
        };
        assert_eq!(entry.destination_path().unwrap(), PathBuf::new());

        let nested = FileEntry {
            destination: Some("/boot/firmware/".to_string()),
            ..entry.clone()
        };
        assert_eq!(nested.destination_path().unwrap(), PathBuf::from("boot/firmware"));

        let escaping = FileEntry {
            destination: Some("../outside".to_string()),
            ..entry
        };
        assert!(escaping.destination_path().is_err());
    }

    #[test]
    fn test_repo_url_alias_and_arch_override() {
        let yaml = r#"
arch: amd64
apt_repos:
  - url: http://archive.ubuntu.com/ubuntu
    distro: jammy
    components: [main]
  - apt_repo: http://ports.example.com
    distro: stable
    components: [main]
    arch: arm64
"#;
        let manifest = Manifest::from_yaml(yaml).unwrap();
        let repos = manifest.repositories();
        assert_eq!(repos[0].apt_repo, "http://archive.ubuntu.com/ubuntu");
        assert_eq!(repos[0].arch.as_deref(), Some("amd64"));
        assert_eq!(repos[1].arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn test_archive_name_must_be_plain() {
        assert!(Manifest::from_yaml("archive_name: ''\n").is_err());
        assert!(Manifest::from_yaml("archive_name: out/boot.tar\n").is_err());
        assert!(Manifest::from_yaml("archive_name: '.'\n").is_err());
        assert!(Manifest::from_yaml("archive_name: '..'\n").is_err());
    }

    #[test]
    fn test_empty_manifest_rejected() {
        assert!(Manifest::from_yaml("   \n").is_err());
    }

    #[test]
    fn test_load_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.yaml");
        fs::write(&path, "scripts: [config.sh]\n").unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.base_dir, dir.path());
        assert_eq!(manifest.script_paths(), vec![dir.path().join("config.sh")]);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Manifest::load(Path::new("/nonexistent/boot.yaml")).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }
}
