use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bushi_core::{ExportedCommit, Mark, Repository, ResolvedReference};
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, params};
use serde::Serialize;

use super::schema::init_database;
use super::store::{CommitId, IndexStore, RepoId, StoreError, StoredRepository};

/// SQLite virtual machine steps between deadline checks.
const PROGRESS_OPS: i32 = 1000;

/// A stored commit with its touched files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub oid: String,
    pub mark: Option<Mark>,
    pub parent_id: Option<CommitId>,
    pub depth: i64,
    pub files: Vec<String>,
}

/// A stored reference with the oid of its target commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceRecord {
    pub full_name: String,
    pub short_name: String,
    pub is_tag: bool,
    pub commit_oid: String,
    pub timestamp: i64,
}

/// Row counts for one repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryStats {
    pub commits: u64,
    pub references: u64,
    pub files: u64,
}

/// SQLite-backed index.
pub struct IndexDb {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl IndexDb {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        Self::new(Connection::open(path)?, timeout)
    }

    /// Wrap an open connection.
    ///
    /// A zero `timeout` disables the write deadline and leaves the
    /// connection's own busy handler in place.
    pub fn new(conn: Connection, timeout: Duration) -> Result<Self, StoreError> {
        if !timeout.is_zero() {
            conn.busy_timeout(timeout)?;
        }
        init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        })
    }

    /// Run `op` on the connection under the write deadline.
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        if !self.timeout.is_zero() {
            let deadline = Instant::now() + self.timeout;
            conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        }
        let result = op(&mut *conn);
        conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
        result.map_err(|err| self.classify(err))
    }

    /// Interrupted and lock-contended writes count as timeouts.
    fn classify(&self, err: StoreError) -> StoreError {
        match &err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    ErrorCode::OperationInterrupted
                        | ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Timeout(self.timeout)
            }
            _ => err,
        }
    }

    // ===== Repository operations =====

    /// Get a repository by name
    pub fn repository_by_name(&self, name: &str) -> Result<Option<StoredRepository>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, path, head, description FROM repositories WHERE name = ?",
                    [name],
                    row_to_repository,
                )
                .optional()?)
        })
    }

    /// List all repositories, ordered by name
    pub fn list_repositories(&self) -> Result<Vec<StoredRepository>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, path, head, description FROM repositories ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_repository)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Rename a repository. Returns false if it does not exist.
    pub fn rename_repository(&self, repo_id: RepoId, new_name: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE repositories SET name = ?, updated_at = ? WHERE id = ?",
                params![new_name, Utc::now().timestamp(), repo_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete a repository with its commits and references.
    /// File rows are shared and stay.
    pub fn delete_repository(&self, repo_id: RepoId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM repositories WHERE id = ?", [repo_id])?;
            Ok(changed > 0)
        })
    }

    /// Count commits, references and distinct files of a repository
    pub fn repository_stats(&self, repo_id: RepoId) -> Result<RepositoryStats, StoreError> {
        self.with_conn(|conn| {
            let commits: i64 = conn.query_row(
                "SELECT COUNT(*) FROM commits WHERE repo_id = ?",
                [repo_id],
                |row| row.get(0),
            )?;
            let references: i64 = conn.query_row(
                "SELECT COUNT(*) FROM refs WHERE repo_id = ?",
                [repo_id],
                |row| row.get(0),
            )?;
            let files: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT cf.file_id)
                 FROM commit_files cf
                 JOIN commits c ON c.id = cf.commit_id
                 WHERE c.repo_id = ?",
                [repo_id],
                |row| row.get(0),
            )?;
            Ok(RepositoryStats {
                commits: commits as u64,
                references: references as u64,
                files: files as u64,
            })
        })
    }

    // ===== Commit operations =====

    /// Get a commit id by oid
    pub fn commit_id_by_oid(
        &self,
        repo_id: RepoId,
        oid: &str,
    ) -> Result<Option<CommitId>, StoreError> {
        self.with_conn(|conn| Ok(find_commit_id(conn, repo_id, oid)?))
    }

    /// Get a commit with its files by oid
    pub fn commit_by_oid(
        &self,
        repo_id: RepoId,
        oid: &str,
    ) -> Result<Option<CommitRecord>, StoreError> {
        self.with_conn(|conn| {
            let commit = conn
                .query_row(
                    "SELECT id, oid, mark, parent_id, depth FROM commits
                     WHERE repo_id = ? AND oid = ?",
                    params![repo_id, oid],
                    |row| {
                        Ok(CommitRecord {
                            id: row.get(0)?,
                            oid: row.get(1)?,
                            mark: row.get(2)?,
                            parent_id: row.get(3)?,
                            depth: row.get(4)?,
                            files: Vec::new(),
                        })
                    },
                )
                .optional()?;
            let Some(mut commit) = commit else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT f.name FROM commit_files cf
                 JOIN files f ON f.id = cf.file_id
                 WHERE cf.commit_id = ?
                 ORDER BY f.name",
            )?;
            commit.files = stmt
                .query_map([commit.id], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            Ok(Some(commit))
        })
    }

    /// Skip-list entries of a commit, ordered by level.
    ///
    /// Entry `k` is the commit `2^k` first-parent steps up.
    pub fn ancestors_of(&self, commit_id: CommitId) -> Result<Vec<CommitId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ancestor_id FROM ancestors WHERE commit_id = ? ORDER BY level",
            )?;
            let rows = stmt.query_map([commit_id], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// The commit `n` first-parent steps above `commit_id`, if history is
    /// that deep.
    pub fn nth_ancestor(&self, commit_id: CommitId, n: u64) -> Result<Option<CommitId>, StoreError> {
        self.with_conn(|conn| {
            let mut current = commit_id;
            let mut remaining = n;
            let mut level = 0u32;
            while remaining > 0 {
                if remaining & 1 == 1 {
                    match skip_entry(conn, current, level)? {
                        Some(next) => current = next,
                        None => return Ok(None),
                    }
                }
                remaining >>= 1;
                level += 1;
            }
            Ok(Some(current))
        })
    }

    // ===== Reference operations =====

    /// List references of a repository: branches first, then tags
    pub fn list_references(&self, repo_id: RepoId) -> Result<Vec<ReferenceRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.full_name, r.short_name, r.is_tag, c.oid, r.timestamp
                 FROM refs r
                 JOIN commits c ON c.id = r.commit_id
                 WHERE r.repo_id = ?
                 ORDER BY r.is_tag, r.full_name",
            )?;
            let rows = stmt.query_map([repo_id], |row| {
                Ok(ReferenceRecord {
                    full_name: row.get(0)?,
                    short_name: row.get(1)?,
                    is_tag: row.get(2)?,
                    commit_oid: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

impl IndexStore for IndexDb {
    fn store_repository(&self, repo: &Repository) -> Result<StoredRepository, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now().timestamp();
            let id: RepoId = conn.query_row(
                "INSERT INTO repositories (name, path, head, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                     path = excluded.path,
                     head = excluded.head,
                     description = excluded.description,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    repo.name,
                    repo.path.to_string_lossy(),
                    repo.head,
                    repo.description,
                    now
                ],
                |row| row.get(0),
            )?;
            Ok(StoredRepository {
                id,
                repository: repo.clone(),
            })
        })
    }

    fn store_commit(
        &self,
        repo_id: RepoId,
        commit: &ExportedCommit,
    ) -> Result<CommitId, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = insert_commit(&tx, repo_id, commit)?;
            tx.commit()?;
            Ok(id)
        })
    }

    fn store_reference(
        &self,
        repo_id: RepoId,
        reference: &ResolvedReference,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let commit_id = find_commit_id(conn, repo_id, &reference.target_oid)?.ok_or_else(
                || StoreError::UnknownCommit {
                    repo_id,
                    oid: reference.target_oid.clone(),
                },
            )?;
            conn.execute(
                "INSERT INTO refs (repo_id, full_name, short_name, is_tag, commit_id, timestamp, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(repo_id, full_name) DO UPDATE SET
                     short_name = excluded.short_name,
                     is_tag = excluded.is_tag,
                     commit_id = excluded.commit_id,
                     timestamp = excluded.timestamp,
                     updated_at = excluded.updated_at",
                params![
                    repo_id,
                    reference.full_name,
                    reference.short_name,
                    reference.is_tag,
                    commit_id,
                    reference.timestamp,
                    Utc::now().timestamp()
                ],
            )?;
            Ok(())
        })
    }

    fn prune_references(&self, repo_id: RepoId, keep: &[String]) -> Result<usize, StoreError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stale: Vec<String> = {
                let mut stmt = tx.prepare("SELECT full_name FROM refs WHERE repo_id = ?")?;
                let names = stmt
                    .query_map([repo_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                names
                    .into_iter()
                    .filter(|name| !keep.contains(name.as_str()))
                    .collect()
            };
            for name in &stale {
                tx.execute(
                    "DELETE FROM refs WHERE repo_id = ? AND full_name = ?",
                    params![repo_id, name],
                )?;
            }
            tx.commit()?;
            Ok(stale.len())
        })
    }
}

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRepository> {
    Ok(StoredRepository {
        id: row.get(0)?,
        repository: Repository {
            name: row.get(1)?,
            path: PathBuf::from(row.get::<_, String>(2)?),
            head: row.get(3)?,
            description: row.get(4)?,
        },
    })
}

fn find_commit_id(
    conn: &Connection,
    repo_id: RepoId,
    oid: &str,
) -> rusqlite::Result<Option<CommitId>> {
    conn.query_row(
        "SELECT id FROM commits WHERE repo_id = ? AND oid = ?",
        params![repo_id, oid],
        |row| row.get(0),
    )
    .optional()
}

fn skip_entry(
    conn: &Connection,
    commit_id: CommitId,
    level: u32,
) -> rusqlite::Result<Option<CommitId>> {
    conn.prepare_cached("SELECT ancestor_id FROM ancestors WHERE commit_id = ? AND level = ?")?
        .query_row(params![commit_id, level], |row| row.get(0))
        .optional()
}

/// Insert one commit inside an open transaction.
fn insert_commit(
    tx: &Transaction<'_>,
    repo_id: RepoId,
    commit: &ExportedCommit,
) -> Result<CommitId, StoreError> {
    let repo_exists = tx
        .query_row("SELECT 1 FROM repositories WHERE id = ?", [repo_id], |_| Ok(()))
        .optional()?
        .is_some();
    if !repo_exists {
        return Err(StoreError::UnknownRepository(repo_id));
    }

    // Already stored by an earlier run: only the mark may have changed.
    if let Some((id, mark)) = tx
        .query_row(
            "SELECT id, mark FROM commits WHERE repo_id = ? AND oid = ?",
            params![repo_id, commit.original_oid],
            |row| Ok((row.get::<_, CommitId>(0)?, row.get::<_, Option<Mark>>(1)?)),
        )
        .optional()?
    {
        if mark != Some(commit.mark) {
            release_mark(tx, repo_id, commit.mark)?;
            tx.execute(
                "UPDATE commits SET mark = ? WHERE id = ?",
                params![commit.mark, id],
            )?;
        }
        return Ok(id);
    }

    let parent = match commit.parent_mark {
        Some(mark) => Some(
            tx.query_row(
                "SELECT id, depth FROM commits WHERE repo_id = ? AND mark = ?",
                params![repo_id, mark],
                |row| Ok((row.get::<_, CommitId>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .ok_or(StoreError::UnknownParentMark { repo_id, mark })?,
        ),
        None => None,
    };
    let (parent_id, depth) = match parent {
        Some((id, depth)) => (Some(id), depth + 1),
        None => (None, 0),
    };

    release_mark(tx, repo_id, commit.mark)?;
    tx.execute(
        "INSERT INTO commits (repo_id, oid, mark, parent_id, depth, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            repo_id,
            commit.original_oid,
            commit.mark,
            parent_id,
            depth,
            Utc::now().timestamp()
        ],
    )?;
    let id = tx.last_insert_rowid();

    if let Some(parent_id) = parent_id {
        insert_skip_list(tx, id, parent_id)?;
    }
    link_files(tx, id, &commit.files)?;
    Ok(id)
}

/// Detach a mark from whatever commit holds it, so it can be reassigned.
fn release_mark(tx: &Transaction<'_>, repo_id: RepoId, mark: Mark) -> rusqlite::Result<()> {
    let released = tx.execute(
        "UPDATE commits SET mark = NULL WHERE repo_id = ? AND mark = ?",
        params![repo_id, mark],
    )?;
    if released > 0 {
        tracing::debug!(repo_id, mark, "mark reassigned");
    }
    Ok(())
}

fn insert_skip_list(
    tx: &Transaction<'_>,
    commit_id: CommitId,
    parent_id: CommitId,
) -> rusqlite::Result<()> {
    let mut insert = tx.prepare_cached(
        "INSERT INTO ancestors (commit_id, level, ancestor_id) VALUES (?, ?, ?)",
    )?;
    let mut ancestor = parent_id;
    let mut level = 0u32;
    loop {
        insert.execute(params![commit_id, level, ancestor])?;
        // 2^(k+1) steps up = 2^k steps up from the 2^k-th ancestor.
        match skip_entry(tx, ancestor, level)? {
            Some(next) => ancestor = next,
            None => break,
        }
        level += 1;
    }
    Ok(())
}

fn link_files(tx: &Transaction<'_>, commit_id: CommitId, files: &[String]) -> rusqlite::Result<()> {
    let mut upsert_file = tx.prepare_cached(
        "INSERT INTO files (name) VALUES (?)
         ON CONFLICT(name) DO UPDATE SET name = excluded.name
         RETURNING id",
    )?;
    let mut link = tx.prepare_cached(
        "INSERT OR IGNORE INTO commit_files (commit_id, file_id) VALUES (?, ?)",
    )?;
    for name in files {
        let file_id: i64 = upsert_file.query_row([name], |row| row.get(0))?;
        link.execute(params![commit_id, file_id])?;
    }
    Ok(())
}
