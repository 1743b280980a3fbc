//! Repository helpers shared by the export surfaces and configuration.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use git2::{Repository, RepositoryOpenFlags};

/// Open the repository whose control directory is exactly `path`.
///
/// Parent directories are not searched.
pub fn open_repository(path: &Path) -> Result<Repository, git2::Error> {
    Repository::open_ext(path, RepositoryOpenFlags::NO_SEARCH, &[] as &[&OsStr])
}

/// Whether `path` is a git control directory: a bare repository or the
/// `.git` directory of a worktree. A worktree root is not.
pub fn is_git_dir(path: &Path) -> bool {
    let Ok(repo) = open_repository(path) else {
        return false;
    };
    match (fs::canonicalize(repo.path()), fs::canonicalize(path)) {
        (Ok(control), Ok(given)) => control == given,
        _ => false,
    }
}

/// Derive a display name from a repository path.
///
/// `aports/.git`, `aports.git` and `aports` all give `aports`.
pub fn name_from_path(path: &Path) -> String {
    let path = if path.file_name() == Some(OsStr::new(".git")) {
        path.parent().unwrap_or(path)
    } else {
        path
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(".git") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}

/// Check that a `git` executable can be run.
pub fn check_git_available() -> io::Result<String> {
    let output = Command::new("git")
        .arg("version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "git version exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Make sure a mark file exists, optionally truncating it.
///
/// Returns `true` when the file was created or cleared, meaning the next
/// export starts from scratch.
pub fn init_mark_file(path: &Path, clear: bool) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existed = path.exists();
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(clear)
        .open(path)?;
    Ok(clear || !existed)
}

/// Branch `HEAD` points at, without the `refs/heads/` prefix.
///
/// Returns `None` for a detached `HEAD`.
pub fn default_head(repo: &Repository) -> Option<String> {
    let head = repo.find_reference("HEAD").ok()?;
    let target = head.symbolic_target()?;
    Some(target.strip_prefix("refs/heads/").unwrap_or(target).to_string())
}
