//! Indexer configuration: a TOML file validated into a [`ResolvedConfig`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bushi_core::Repository;
use bushi_core::git::{
    check_git_available, default_head, init_mark_file, is_git_dir, name_from_path,
    open_repository,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the configuration file, read by the CLI.
pub const CONFIG_ENV: &str = "BUSHI_CONFIG";

/// File looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "bushi.toml";

/// Configuration as written in the TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Frontend metadata.
    #[serde(default)]
    pub www: WwwConfig,
    /// Storage locations.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ingestion tuning.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Repositories to index.
    #[serde(default, rename = "repo", alias = "repositories")]
    pub repos: Vec<RepoConfig>,
}

/// Site metadata shown by the browsing frontend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WwwConfig {
    /// Site name (default: "bushi example")
    #[serde(default = "default_site_name")]
    pub name: String,
    /// Site description
    #[serde(default)]
    pub description: String,
}

impl Default for WwwConfig {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            description: String::new(),
        }
    }
}

fn default_site_name() -> String {
    "bushi example".to_string()
}

/// Database and mark-file locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file (default: bushi.db)
    #[serde(default = "default_sqlite")]
    pub sqlite: PathBuf,
    /// Directory holding one mark file per repository (default: marks)
    #[serde(default = "default_mark_dir")]
    pub mark_dir: PathBuf,
    /// Deadline for a single write, in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite: default_sqlite(),
            mark_dir: default_mark_dir(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_sqlite() -> PathBuf {
    PathBuf::from("bushi.db")
}

fn default_mark_dir() -> PathBuf {
    PathBuf::from("marks")
}

fn default_timeout_secs() -> u64 {
    5
}

/// How repositories are scheduled and streamed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Repositories ingested in parallel (default: 1)
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Stop starting new repositories after the first failure (default: false)
    #[serde(default)]
    pub fail_fast: bool,
    /// Commit records buffered between exporter and store (default: 64)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Seconds without a record before the exporter is killed; 0 waits forever
    #[serde(default)]
    pub export_idle_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            fail_fast: false,
            channel_capacity: default_channel_capacity(),
            export_idle_timeout_secs: 0,
        }
    }
}

fn default_jobs() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    64
}

impl IngestConfig {
    /// Idle timeout for the exporter, `None` when unbounded.
    pub fn export_idle_timeout(&self) -> Option<Duration> {
        (self.export_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.export_idle_timeout_secs))
    }
}

/// One `[[repo]]` entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepoConfig {
    /// Display name; derived from the path when empty.
    #[serde(default)]
    pub name: String,
    /// Control directory: a bare repository or a `.git` directory.
    pub path: PathBuf,
    /// Default branch; read from `HEAD` when empty.
    #[serde(default)]
    pub head: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// Configuration after validation, with absolute paths everywhere.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Frontend metadata.
    pub www: WwwConfig,
    /// Absolute database file path.
    pub sqlite: PathBuf,
    /// Absolute, existing mark directory.
    pub mark_dir: PathBuf,
    /// Per-write deadline.
    pub write_timeout: Duration,
    /// Ingestion tuning.
    pub ingest: IngestConfig,
    /// Validated repositories, in file order.
    pub repositories: Vec<ResolvedRepository>,
}

/// A validated repository and its mark file.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedRepository {
    /// Repository identity handed to the store.
    pub repository: Repository,
    /// Mark file used by the exporter.
    pub marks_file: PathBuf,
}

impl ResolvedConfig {
    /// Look up a repository by name.
    pub fn repository(&self, name: &str) -> Option<&ResolvedRepository> {
        self.repositories
            .iter()
            .find(|repo| repo.repository.name == name)
    }
}

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("git executable is not available: {0}")]
    GitMissing(#[source] io::Error),

    #[error("repository path {path} is invalid: {source}")]
    RepoPath { path: PathBuf, source: io::Error },

    #[error("{0} is not a git control directory (point at a bare repository or a .git directory)")]
    NotGitDir(PathBuf),

    #[error("repository name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("cannot derive a repository name from {0}")]
    EmptyName(PathBuf),

    #[error("failed to prepare mark file {path}: {source}")]
    MarkFile { path: PathBuf, source: io::Error },
}

/// Pick the configuration file: `explicit` (the `--config` flag or
/// `$BUSHI_CONFIG`), then `bushi.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf)
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Validate everything and prepare mark files.
    ///
    /// With `full` set every mark file is truncated so the next export
    /// starts from the first commit.
    pub fn resolve(self, full: bool) -> Result<ResolvedConfig, ConfigError> {
        let version = check_git_available().map_err(ConfigError::GitMissing)?;
        tracing::debug!(%version, "found git");

        let mark_dir = absolute(&self.database.mark_dir)?;
        fs::create_dir_all(&mark_dir).map_err(|source| ConfigError::MarkFile {
            path: mark_dir.clone(),
            source,
        })?;
        let sqlite = absolute(&self.database.sqlite)?;

        let mut repositories: Vec<ResolvedRepository> = Vec::with_capacity(self.repos.len());
        for entry in self.repos {
            let repository = resolve_repository(entry)?;
            if repositories
                .iter()
                .any(|seen| seen.repository.name == repository.name)
            {
                return Err(ConfigError::DuplicateName(repository.name));
            }

            let marks_file = mark_dir.join(&repository.name);
            let fresh = init_mark_file(&marks_file, full).map_err(|source| ConfigError::MarkFile {
                path: marks_file.clone(),
                source,
            })?;
            if fresh {
                tracing::info!(
                    repo = %repository.name,
                    marks = %marks_file.display(),
                    "starting from an empty mark file"
                );
            }
            repositories.push(ResolvedRepository {
                repository,
                marks_file,
            });
        }

        Ok(ResolvedConfig {
            www: self.www,
            sqlite,
            mark_dir,
            write_timeout: Duration::from_secs(self.database.timeout_secs),
            ingest: self.ingest,
            repositories,
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::RepoPath {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_repository(entry: RepoConfig) -> Result<Repository, ConfigError> {
    let path = fs::canonicalize(&entry.path).map_err(|source| ConfigError::RepoPath {
        path: entry.path.clone(),
        source,
    })?;
    if !is_git_dir(&path) {
        return Err(ConfigError::NotGitDir(path));
    }

    let name = if entry.name.is_empty() {
        name_from_path(&path)
    } else {
        entry.name
    };
    if name.is_empty() {
        return Err(ConfigError::EmptyName(path));
    }

    let head = if entry.head.is_empty() {
        open_repository(&path)
            .ok()
            .and_then(|repo| default_head(&repo))
            .unwrap_or_else(|| "master".to_string())
    } else {
        entry.head
    };

    Ok(Repository {
        name,
        path,
        head,
        description: entry.description,
    })
}
