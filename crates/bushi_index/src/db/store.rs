//! The storage contract the ingestion pipeline writes through.

use std::time::Duration;

use bushi_core::{ExportedCommit, Mark, Repository, ResolvedReference};
use serde::Serialize;
use thiserror::Error;

/// Row id of a stored repository.
pub type RepoId = i64;

/// Row id of a stored commit.
pub type CommitId = i64;

/// A repository together with its store identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRepository {
    pub id: RepoId,
    #[serde(flatten)]
    pub repository: Repository,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("write did not finish within {0:?}")]
    Timeout(Duration),

    #[error("unknown repository id {0}")]
    UnknownRepository(RepoId),

    #[error("parent mark :{mark} is not stored for repository {repo_id}")]
    UnknownParentMark { repo_id: RepoId, mark: Mark },

    #[error("commit {oid} is not stored for repository {repo_id}")]
    UnknownCommit { repo_id: RepoId, oid: String },

    #[error("SQLite {0} is too old, 3.35.0 or newer is required")]
    UnsupportedSqlite(String),

    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Writes the ingestion pipeline depends on.
///
/// Implementations must keep every operation idempotent: the same
/// repository, commit or reference may be stored again on every run.
pub trait IndexStore: Send + Sync {
    /// Insert or update a repository keyed by its name.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn store_repository(&self, repo: &Repository) -> Result<StoredRepository, StoreError>;

    /// Insert a commit, resolving its parent mark to a stored commit.
    ///
    /// A commit already stored under the same oid is not duplicated.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::UnknownRepository`] or
    /// [`StoreError::UnknownParentMark`] when the references cannot be
    /// resolved.
    fn store_commit(&self, repo_id: RepoId, commit: &ExportedCommit)
    -> Result<CommitId, StoreError>;

    /// Insert or update a reference keyed by `(repository, full name)`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::UnknownCommit`] when the target commit is
    /// not stored.
    fn store_reference(
        &self,
        repo_id: RepoId,
        reference: &ResolvedReference,
    ) -> Result<(), StoreError>;

    /// Drop references of `repo_id` whose full name is not in `keep`.
    /// Returns the number of removed rows.
    fn prune_references(&self, _repo_id: RepoId, _keep: &[String]) -> Result<usize, StoreError> {
        Ok(0)
    }
}
