//! Privilege-emulating filesystem shell.
//!
//! Every filesystem mutation of the assembly stages goes through
//! [`FakeRoot::run`]. The shell performs the real operation where an
//! unprivileged user can, and records ownership and permission bits it
//! cannot really apply in an ownership ledger. The archive operation reads
//! the ledger, never the real owner, so the invoking user's uid/gid never
//! appears in the output.
//!
//! Paths nobody chowned or chmodded are reported as owned by `0:0` with
//! their real permission bits, the way files look inside a fakeroot session.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::common::{absolutize, archive_name};
use crate::process::{Cmd, CommandResult};

/// Emulated ownership and permissions of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attrs {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits; `None` means "whatever the real file has".
    pub mode: Option<u32>,
}

/// A filesystem operation. Arguments are kept apart from each other; nothing
/// is ever re-parsed by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    Mkdir { path: PathBuf, parents: bool },
    Copy { src: PathBuf, dst: PathBuf, recursive: bool },
    Chmod { path: PathBuf, mode: u32, recursive: bool },
    Chown { path: PathBuf, uid: u32, gid: u32, recursive: bool },
    Stat { path: PathBuf },
    Move { src: PathBuf, dst: PathBuf },
    Remove { path: PathBuf },
    /// Pack everything below `root` into the tar file `archive`.
    Archive { root: PathBuf, archive: PathBuf },
}

impl FsOp {
    /// `mkdir -p`
    pub fn mkdir_p(path: impl Into<PathBuf>) -> Self {
        FsOp::Mkdir {
            path: path.into(),
            parents: true,
        }
    }

    pub fn copy(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        FsOp::Copy {
            src: src.into(),
            dst: dst.into(),
            recursive: false,
        }
    }

    /// `cp -R`
    pub fn copy_tree(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        FsOp::Copy {
            src: src.into(),
            dst: dst.into(),
            recursive: true,
        }
    }

    pub fn chmod(path: impl Into<PathBuf>, mode: u32) -> Self {
        FsOp::Chmod {
            path: path.into(),
            mode,
            recursive: false,
        }
    }

    pub fn chown(path: impl Into<PathBuf>, uid: u32, gid: u32) -> Self {
        FsOp::Chown {
            path: path.into(),
            uid,
            gid,
            recursive: false,
        }
    }

    /// `chown -R`
    pub fn chown_tree(path: impl Into<PathBuf>, uid: u32, gid: u32) -> Self {
        FsOp::Chown {
            path: path.into(),
            uid,
            gid,
            recursive: true,
        }
    }

    pub fn stat(path: impl Into<PathBuf>) -> Self {
        FsOp::Stat { path: path.into() }
    }

    pub fn mv(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        FsOp::Move {
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        FsOp::Remove { path: path.into() }
    }

    pub fn archive(root: impl Into<PathBuf>, archive: impl Into<PathBuf>) -> Self {
        FsOp::Archive {
            root: root.into(),
            archive: archive.into(),
        }
    }
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsOp::Mkdir { path, parents } => {
                write!(f, "mkdir {}{}", if *parents { "-p " } else { "" }, path.display())
            }
            FsOp::Copy { src, dst, recursive } => write!(
                f,
                "cp {}{} {}",
                if *recursive { "-R " } else { "" },
                src.display(),
                dst.display()
            ),
            FsOp::Chmod { path, mode, recursive } => write!(
                f,
                "chmod {}{:o} {}",
                if *recursive { "-R " } else { "" },
                mode,
                path.display()
            ),
            FsOp::Chown { path, uid, gid, recursive } => write!(
                f,
                "chown {}{}:{} {}",
                if *recursive { "-R " } else { "" },
                uid,
                gid,
                path.display()
            ),
            FsOp::Stat { path } => write!(f, "stat {}", path.display()),
            FsOp::Move { src, dst } => write!(f, "mv {} {}", src.display(), dst.display()),
            FsOp::Remove { path } => write!(f, "rm -rf {}", path.display()),
            FsOp::Archive { root, archive } => {
                write!(f, "tar -cf {} -C {} .", archive.display(), root.display())
            }
        }
    }
}

/// Output of a shell operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    /// Set when the operation failed and the caller did not ask for checking.
    pub error: Option<String>,
}

impl ShellOutput {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("`{command}` failed: {message}")]
    Failed { command: String, message: String },
}

/// The privilege-emulation session of one build.
#[derive(Debug, Default)]
pub struct FakeRoot {
    ledger: BTreeMap<PathBuf, Attrs>,
    source_date_epoch: u64,
}

impl FakeRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp written as mtime of every archive entry.
    pub fn with_source_date_epoch(mut self, epoch: u64) -> Self {
        self.source_date_epoch = epoch;
        self
    }

    /// Run `op` with relative paths resolved against `cwd`.
    ///
    /// With `check`, a failure is returned as [`ShellError`]; without it the
    /// failure is reported in [`ShellOutput::error`].
    pub fn run(&mut self, op: &FsOp, cwd: &Path, check: bool) -> Result<ShellOutput, ShellError> {
        tracing::debug!(op = %op, "fakeroot");
        let result = self.execute(op, cwd);
        finish(op.to_string(), result, check)
    }

    /// Run an external command with `root` as its apparent filesystem root.
    ///
    /// The command runs in `root`, receives `root` as its last argument and
    /// finds it in `BOOTGEN_ROOT` and `TARGET_DIR`. Anything it creates is
    /// archived as owned by `0:0`.
    ///
    /// Afterwards the ledger is reconciled with what the command left behind:
    /// paths it removed or replaced lose their recorded attributes, and a
    /// permission change it made to a recorded path is adopted.
    pub fn run_in_root(
        &mut self,
        cmd: Cmd,
        root: &Path,
        check: bool,
    ) -> Result<ShellOutput, ShellError> {
        let cmd = cmd
            .arg_path(root)
            .dir(root)
            .env("BOOTGEN_ROOT", root.as_os_str())
            .env("TARGET_DIR", root.as_os_str())
            .allow_fail();
        let rendered = cmd.display();
        tracing::debug!(command = %rendered, root = %root.display(), "fakeroot exec");

        let before = self.snapshot();
        let result = run_retrying_busy(cmd);
        self.reconcile(before);

        let result = match result {
            Ok(out) if out.success() => Ok(out.stdout),
            Ok(out) => {
                let stderr = out.stderr_trimmed();
                Err(if stderr.is_empty() {
                    format!("exit code {}", out.code())
                } else {
                    format!("exit code {}: {}", out.code(), stderr)
                })
            }
            Err(e) => Err(format!("{:#}", e)),
        };
        finish(rendered, result, check)
    }

    /// Emulated attributes of `path` as the archive will see them.
    pub fn attrs(&self, path: &Path) -> Attrs {
        self.ledger.get(path).copied().unwrap_or_default()
    }

    fn execute(&mut self, op: &FsOp, cwd: &Path) -> Result<String, String> {
        match op {
            FsOp::Mkdir { path, parents } => {
                let path = absolutize(path, cwd);
                let created = if *parents {
                    fs::create_dir_all(&path)
                } else {
                    fs::create_dir(&path)
                };
                created.map_err(|e| io_message("cannot create directory", &path, &e))?;
                Ok(String::new())
            }
            FsOp::Copy { src, dst, recursive } => {
                let src = absolutize(src, cwd);
                let dst = absolutize(dst, cwd);
                self.copy(&src, &dst, *recursive)
            }
            FsOp::Chmod { path, mode, recursive } => {
                let path = absolutize(path, cwd);
                self.chmod(&path, *mode, *recursive)
            }
            FsOp::Chown { path, uid, gid, recursive } => {
                let path = absolutize(path, cwd);
                self.chown(&path, *uid, *gid, *recursive)
            }
            FsOp::Stat { path } => {
                let path = absolutize(path, cwd);
                self.stat(&path)
            }
            FsOp::Move { src, dst } => {
                let src = absolutize(src, cwd);
                let dst = absolutize(dst, cwd);
                self.move_path(&src, &dst)
            }
            FsOp::Remove { path } => {
                let path = absolutize(path, cwd);
                remove_path(&path).map_err(|e| io_message("cannot remove", &path, &e))?;
                self.forget(&path);
                Ok(String::new())
            }
            FsOp::Archive { root, archive } => {
                let root = absolutize(root, cwd);
                let archive = absolutize(archive, cwd);
                self.archive(&root, &archive)
            }
        }
    }

    fn copy(&mut self, src: &Path, dst: &Path, recursive: bool) -> Result<String, String> {
        let meta = fs::symlink_metadata(src).map_err(|e| io_message("cannot stat", src, &e))?;
        if meta.is_dir() && !recursive {
            return Err(format!("-R not specified; omitting directory '{}'", src.display()));
        }

        let target = if dst.is_dir() {
            let name = src
                .file_name()
                .ok_or_else(|| format!("cannot copy '{}': no file name", src.display()))?;
            dst.join(name)
        } else {
            dst.to_path_buf()
        };
        if target == src {
            return Err(format!("'{}' and '{}' are the same file", src.display(), target.display()));
        }

        if meta.file_type().is_symlink() {
            // the link itself, never what it points to
            let link = fs::read_link(src).map_err(|e| io_message("cannot read link", src, &e))?;
            if fs::symlink_metadata(&target).is_ok() {
                remove_path(&target).map_err(|e| io_message("cannot overwrite", &target, &e))?;
            }
            std::os::unix::fs::symlink(link, &target)
                .map_err(|e| io_message("cannot create link", &target, &e))?;
        } else if meta.is_dir() {
            if target.starts_with(src) {
                return Err(format!(
                    "cannot copy a directory, '{}', into itself",
                    src.display()
                ));
            }
            copy_tree(src, &target).map_err(|e| io_message("cannot copy", src, &e))?;
        } else {
            if target.is_symlink() {
                fs::remove_file(&target).map_err(|e| io_message("cannot overwrite", &target, &e))?;
            }
            fs::copy(src, &target).map_err(|e| io_message("cannot copy", src, &e))?;
        }

        // freshly created paths belong to the (fake) root user
        self.forget(&target);
        Ok(String::new())
    }

    fn chmod(&mut self, path: &Path, mode: u32, recursive: bool) -> Result<String, String> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_message("cannot access", path, &e))?;
        let mode = mode & 0o7777;

        if recursive && meta.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(|e| e.to_string())?;
                if entry.path_is_symlink() {
                    continue;
                }
                self.apply_mode(entry.path(), mode)?;
            }
        } else {
            self.apply_mode(path, mode)?;
        }
        Ok(String::new())
    }

    /// Record `mode` and apply the closest mode that keeps the tree usable
    /// for the invoking user.
    fn apply_mode(&mut self, path: &Path, mode: u32) -> Result<(), String> {
        let meta = fs::metadata(path).map_err(|e| io_message("cannot access", path, &e))?;
        let usable = if meta.is_dir() { mode | 0o700 } else { mode | 0o600 };
        fs::set_permissions(path, fs::Permissions::from_mode(usable))
            .map_err(|e| io_message("changing permissions of", path, &e))?;
        self.ledger.entry(path.to_path_buf()).or_default().mode = Some(mode);
        Ok(())
    }

    fn chown(
        &mut self,
        path: &Path,
        uid: u32,
        gid: u32,
        recursive: bool,
    ) -> Result<String, String> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_message("cannot access", path, &e))?;

        let paths: Vec<PathBuf> = if recursive && meta.is_dir() {
            WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .map(|entry| entry.map(|e| e.into_path()).map_err(|e| e.to_string()))
                .collect::<Result<_, _>>()?
        } else {
            vec![path.to_path_buf()]
        };

        for p in paths {
            let attrs = self.ledger.entry(p).or_default();
            attrs.uid = uid;
            attrs.gid = gid;
        }
        Ok(String::new())
    }

    fn stat(&self, path: &Path) -> Result<String, String> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_message("cannot stat", path, &e))?;
        let attrs = self.attrs(path);
        let kind = if meta.file_type().is_symlink() {
            "symbolic link"
        } else if meta.is_dir() {
            "directory"
        } else {
            "regular file"
        };
        let mode = attrs.mode.unwrap_or(meta.mode() & 0o7777);
        Ok(format!(
            "{}: {} uid={} gid={} mode={:04o} size={}",
            path.display(),
            kind,
            attrs.uid,
            attrs.gid,
            mode,
            meta.len()
        ))
    }

    fn move_path(&mut self, src: &Path, dst: &Path) -> Result<String, String> {
        let meta = fs::symlink_metadata(src).map_err(|e| io_message("cannot stat", src, &e))?;
        let target = if dst.is_dir() {
            let name = src
                .file_name()
                .ok_or_else(|| format!("cannot move '{}': no file name", src.display()))?;
            dst.join(name)
        } else {
            dst.to_path_buf()
        };

        if fs::rename(src, &target).is_err() {
            // different filesystem: copy, then delete the source
            if meta.is_dir() {
                copy_tree(src, &target).map_err(|e| io_message("cannot move", src, &e))?;
            } else {
                fs::copy(src, &target).map_err(|e| io_message("cannot move", src, &e))?;
            }
            remove_path(src).map_err(|e| io_message("cannot remove", src, &e))?;
        }

        self.forget(&target);
        let moved: Vec<(PathBuf, Attrs)> = self
            .ledger
            .iter()
            .filter(|(p, _)| p.starts_with(src))
            .map(|(p, a)| (p.clone(), *a))
            .collect();
        for (old, attrs) in moved {
            self.ledger.remove(&old);
            if let Ok(rel) = old.strip_prefix(src) {
                let new = if rel.as_os_str().is_empty() {
                    target.clone()
                } else {
                    target.join(rel)
                };
                self.ledger.insert(new, attrs);
            }
        }
        Ok(String::new())
    }

    fn archive(&self, root: &Path, archive: &Path) -> Result<String, String> {
        if !root.is_dir() {
            return Err(format!("'{}' is not a directory", root.display()));
        }

        // Collect first so the archive never contains itself.
        let mut entries = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| e.to_string())?;
            if entry.path() == archive {
                continue;
            }
            entries.push(entry.into_path());
        }

        let file = fs::File::create(archive).map_err(|e| io_message("cannot create", archive, &e))?;
        let mut builder = tar::Builder::new(io::BufWriter::new(file));
        let mut listing = String::new();

        for path in &entries {
            let name = archive_name(root, path)
                .ok_or_else(|| format!("'{}' is outside '{}'", path.display(), root.display()))?;
            self.append_entry(&mut builder, path, &name)
                .map_err(|e| io_message("cannot archive", path, &e))?;
            listing.push_str(&name.display().to_string());
            listing.push('\n');
        }

        let writer = builder
            .into_inner()
            .map_err(|e| io_message("cannot finish", archive, &e))?;
        let file = writer
            .into_inner()
            .map_err(|e| io_message("cannot flush", archive, e.error()))?;
        file.sync_all()
            .map_err(|e| io_message("cannot sync", archive, &e))?;

        Ok(listing)
    }

    fn append_entry<W: io::Write>(
        &self,
        builder: &mut tar::Builder<W>,
        path: &Path,
        name: &Path,
    ) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        let attrs = self.attrs(path);
        let mode = attrs.mode.unwrap_or(meta.mode() & 0o7777);

        let mut header = tar::Header::new_gnu();
        header.set_uid(attrs.uid as u64);
        header.set_gid(attrs.gid as u64);
        header.set_mode(mode);
        header.set_mtime(self.source_date_epoch);
        if attrs.uid == 0 {
            header.set_username("root")?;
        }
        if attrs.gid == 0 {
            header.set_groupname("root")?;
        }

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, name, target)
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, name, io::empty())
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let file = fs::File::open(path)?;
            builder.append_data(&mut header, name, file)
        }
    }

    /// Inode and real permission bits of every recorded path.
    fn snapshot(&self) -> BTreeMap<PathBuf, (u64, u32)> {
        self.ledger
            .keys()
            .filter_map(|path| {
                let meta = fs::symlink_metadata(path).ok()?;
                Some((path.clone(), (meta.ino(), meta.mode() & 0o7777)))
            })
            .collect()
    }

    fn reconcile(&mut self, before: BTreeMap<PathBuf, (u64, u32)>) {
        for (path, (ino, mode)) in before {
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.ino() == ino => {
                    let real = meta.mode() & 0o7777;
                    if real != mode {
                        tracing::debug!(
                            path = %path.display(),
                            mode = format_args!("{:o}", real),
                            "mode changed in root"
                        );
                        if let Some(attrs) = self.ledger.get_mut(&path) {
                            attrs.mode = Some(real);
                        }
                    }
                }
                // removed or replaced
                _ => {
                    self.ledger.remove(&path);
                }
            }
        }
    }

    /// Drop ledger state for `path` and everything below it.
    fn forget(&mut self, path: &Path) {
        self.ledger.retain(|p, _| !p.starts_with(path));
    }
}

fn finish(
    command: String,
    result: Result<String, String>,
    check: bool,
) -> Result<ShellOutput, ShellError> {
    match result {
        Ok(stdout) => Ok(ShellOutput { stdout, error: None }),
        Err(message) if check => {
            tracing::error!(command = %command, "{}", message);
            Err(ShellError::Failed { command, message })
        }
        Err(message) => {
            tracing::debug!(command = %command, "{}", message);
            Ok(ShellOutput {
                stdout: String::new(),
                error: Some(message),
            })
        }
    }
}

/// Executing a file that was just written can fail with ETXTBSY while
/// another thread's fork still holds it open for writing.
fn run_retrying_busy(cmd: Cmd) -> anyhow::Result<CommandResult> {
    const ETXTBSY: i32 = 26;
    let mut attempts = 0;
    loop {
        match cmd.clone().run() {
            Err(e)
                if attempts < 5
                    && e.downcast_ref::<io::Error>()
                        .and_then(io::Error::raw_os_error)
                        == Some(ETXTBSY) =>
            {
                attempts += 1;
                std::thread::sleep(std::time::Duration::from_millis(20 * attempts));
            }
            other => return other,
        }
    }
}

fn io_message(what: &str, path: &Path, error: &io::Error) -> String {
    format!("{} '{}': {}", what, path.display(), error)
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// `cp -R` of a directory: merges into an existing target directory, keeps
/// symlinks as symlinks.
fn copy_tree(src: &Path, target: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let dest = if rel.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            if dest.is_symlink() || dest.is_file() {
                fs::remove_file(&dest)?;
            }
            fs::create_dir_all(&dest)?;
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o700))?;
        } else if file_type.is_symlink() {
            if fs::symlink_metadata(&dest).is_ok() {
                remove_path(&dest)?;
            }
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &dest)?;
        } else {
            if dest.is_symlink() {
                fs::remove_file(&dest)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
