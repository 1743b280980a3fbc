//! Per-repository ingestion: repository row, then commits, then references.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bushi_core::git::init_mark_file;
use bushi_core::{
    ExportError, ExportOptions, Mark, RefOutcome, RefWalker, WalkError, spawn_fast_export,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedRepository;
use crate::db::{IndexStore, RepoId, StoreError};

/// Stored commits between two progress lines.
const PROGRESS_EVERY: u64 = 1000;

/// A failure that aborts one repository.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{repo}: failed to prepare mark file {path}: {source}")]
    MarkFile {
        repo: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("{repo}: failed to store repository: {source}")]
    Repository { repo: String, source: StoreError },

    #[error("{repo}: export failed: {source}")]
    Export { repo: String, source: ExportError },

    #[error("{repo}: failed to store commit {oid} (mark :{mark}): {source}")]
    Commit {
        repo: String,
        oid: String,
        mark: Mark,
        source: StoreError,
    },

    #[error("{repo}: reference walk failed: {source}")]
    Walk { repo: String, source: WalkError },

    #[error("{repo}: failed to store reference {reference}: {source}")]
    Reference {
        repo: String,
        reference: String,
        source: StoreError,
    },

    #[error("{repo}: failed to prune references: {source}")]
    Prune { repo: String, source: StoreError },
}

/// How one repository's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Failed { message: String },
    /// Not started because an earlier repository failed.
    Skipped,
}

/// Counters for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryReport {
    pub name: String,
    pub outcome: Outcome,
    pub commits: u64,
    pub references_stored: u64,
    pub references_skipped: u64,
    pub references_failed: u64,
    pub references_pruned: u64,
    pub elapsed_ms: u64,
}

impl RepositoryReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Outcome::Ok,
            commits: 0,
            references_stored: 0,
            references_skipped: 0,
            references_failed: 0,
            references_pruned: 0,
            elapsed_ms: 0,
        }
    }

    fn with_outcome(name: &str, outcome: Outcome) -> Self {
        Self {
            outcome,
            ..Self::new(name)
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// Result of a multi-repository run, in configuration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub repositories: Vec<RepositoryReport>,
}

impl IngestReport {
    /// True when no repository failed or was skipped.
    pub fn is_success(&self) -> bool {
        self.repositories
            .iter()
            .all(|report| report.outcome == Outcome::Ok)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RepositoryReport> {
        self.repositories.iter().filter(|report| report.is_failed())
    }
}

/// Drives the export surfaces into an [`IndexStore`].
pub struct Ingestor<S: ?Sized> {
    store: Arc<S>,
    options: ExportOptions,
}

impl<S: IndexStore + ?Sized> Ingestor<S> {
    pub fn new(store: Arc<S>, options: ExportOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Ingest one repository, turning any failure into a failed report.
    pub fn ingest_repository(&self, target: &ResolvedRepository) -> RepositoryReport {
        let started = Instant::now();
        let name = &target.repository.name;
        let mut report = RepositoryReport::new(name);

        match self.try_ingest(target, &mut report) {
            Ok(()) => info!(
                repo = %name,
                commits = report.commits,
                refs_stored = report.references_stored,
                refs_skipped = report.references_skipped,
                refs_failed = report.references_failed,
                refs_pruned = report.references_pruned,
                elapsed = ?started.elapsed(),
                "repository ingested"
            ),
            Err(err) => {
                error!(repo = %name, commits = report.commits, "{err}");
                report.outcome = Outcome::Failed {
                    message: err.to_string(),
                };
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Store the repository, every exported commit, then every reference.
    ///
    /// Counters in `report` are updated as records are stored, so they stay
    /// meaningful when an error is returned.
    pub fn try_ingest(
        &self,
        target: &ResolvedRepository,
        report: &mut RepositoryReport,
    ) -> Result<(), IngestError> {
        let repo = &target.repository;
        init_mark_file(&target.marks_file, false).map_err(|source| IngestError::MarkFile {
            repo: repo.name.clone(),
            path: target.marks_file.clone(),
            source,
        })?;

        let stored = self
            .store
            .store_repository(repo)
            .map_err(|source| IngestError::Repository {
                repo: repo.name.clone(),
                source,
            })?;
        debug!(repo = %repo.name, id = stored.id, "repository stored");

        self.ingest_commits(stored.id, target, report)?;

        let keep = self.walk_references(stored.id, target, Vec::new(), report)?;
        report.references_pruned = self
            .store
            .prune_references(stored.id, &keep)
            .map_err(|source| IngestError::Prune {
                repo: repo.name.clone(),
                source,
            })? as u64;
        Ok(())
    }

    /// Re-resolve only the named references and upsert them.
    pub fn refresh_references(
        &self,
        target: &ResolvedRepository,
        names: Vec<String>,
    ) -> Result<RepositoryReport, IngestError> {
        let started = Instant::now();
        let repo = &target.repository;
        let mut report = RepositoryReport::new(&repo.name);

        let stored = self
            .store
            .store_repository(repo)
            .map_err(|source| IngestError::Repository {
                repo: repo.name.clone(),
                source,
            })?;
        self.walk_references(stored.id, target, names, &mut report)?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn ingest_commits(
        &self,
        repo_id: RepoId,
        target: &ResolvedRepository,
        report: &mut RepositoryReport,
    ) -> Result<(), IngestError> {
        let repo = &target.repository;
        let export_error = |source| IngestError::Export {
            repo: repo.name.clone(),
            source,
        };

        let mut stream = spawn_fast_export(repo, &target.marks_file, self.options.clone())
            .map_err(export_error)?;
        for item in stream.by_ref() {
            let commit = item.map_err(export_error)?;
            if commit.is_root() {
                debug!(repo = %repo.name, oid = %commit.original_oid, "root commit");
            }
            self.store
                .store_commit(repo_id, &commit)
                .map_err(|source| IngestError::Commit {
                    repo: repo.name.clone(),
                    oid: commit.original_oid.clone(),
                    mark: commit.mark,
                    source,
                })?;
            report.commits += 1;
            if report.commits % PROGRESS_EVERY == 0 {
                info!(repo = %repo.name, commits = report.commits, last = %commit, "storing commits");
            }
        }
        // Only now may the next run skip what this one exported.
        stream.commit_marks().map_err(export_error)
    }

    /// Walk references and upsert every resolved one.
    ///
    /// Returns the names that still exist, for pruning.
    fn walk_references(
        &self,
        repo_id: RepoId,
        target: &ResolvedRepository,
        names: Vec<String>,
        report: &mut RepositoryReport,
    ) -> Result<Vec<String>, IngestError> {
        let repo = &target.repository;
        let walk_error = |source| IngestError::Walk {
            repo: repo.name.clone(),
            source,
        };

        let walker = RefWalker::open(&repo.path, names).map_err(walk_error)?;
        let mut keep = Vec::new();
        for outcome in walker {
            match outcome.map_err(walk_error)? {
                RefOutcome::Found(reference) => {
                    self.store
                        .store_reference(repo_id, &reference)
                        .map_err(|source| IngestError::Reference {
                            repo: repo.name.clone(),
                            reference: reference.full_name.clone(),
                            source,
                        })?;
                    debug!(
                        repo = %repo.name,
                        reference = %reference.full_name,
                        oid = %reference.target_oid,
                        "reference stored"
                    );
                    report.references_stored += 1;
                    keep.push(reference.full_name);
                }
                RefOutcome::Skipped(name) => {
                    debug!(repo = %repo.name, reference = %name, "reference skipped");
                    report.references_skipped += 1;
                }
                RefOutcome::Failed { name, error } => {
                    warn!(repo = %repo.name, reference = %name, "{error}");
                    report.references_failed += 1;
                    keep.push(name);
                }
            }
        }
        Ok(keep)
    }
}

/// Ingest `targets`, at most `jobs` at a time.
///
/// Each repository runs on the blocking pool; a failure never stops the
/// others unless `fail_fast` is set, in which case repositories not yet
/// started are reported as skipped.
pub async fn ingest_all<S>(
    ingestor: Arc<Ingestor<S>>,
    targets: Vec<ResolvedRepository>,
    jobs: usize,
    fail_fast: bool,
) -> IngestReport
where
    S: IndexStore + ?Sized + 'static,
{
    let names: Vec<String> = targets
        .iter()
        .map(|target| target.repository.name.clone())
        .collect();
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut set = JoinSet::new();

    for (index, target) in targets.into_iter().enumerate() {
        let ingestor = Arc::clone(&ingestor);
        let semaphore = Arc::clone(&semaphore);
        let failed = Arc::clone(&failed);
        set.spawn(async move {
            let name = target.repository.name.clone();
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, RepositoryReport::with_outcome(&name, Outcome::Skipped));
            };
            if fail_fast && failed.load(Ordering::SeqCst) {
                info!(repo = %name, "skipped after an earlier failure");
                return (index, RepositoryReport::with_outcome(&name, Outcome::Skipped));
            }

            let report =
                match tokio::task::spawn_blocking(move || ingestor.ingest_repository(&target))
                    .await
                {
                    Ok(report) => report,
                    Err(err) => {
                        error!(repo = %name, "ingestion task failed: {err}");
                        RepositoryReport::with_outcome(
                            &name,
                            Outcome::Failed {
                                message: format!("ingestion task failed: {err}"),
                            },
                        )
                    }
                };
            if report.is_failed() {
                failed.store(true, Ordering::SeqCst);
            }
            (index, report)
        });
    }

    let mut slots: Vec<Option<RepositoryReport>> = names.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, report)) => slots[index] = Some(report),
            Err(err) => error!("ingestion task failed: {err}"),
        }
    }

    let repositories = slots
        .into_iter()
        .zip(&names)
        .map(|(slot, name)| {
            slot.unwrap_or_else(|| {
                RepositoryReport::with_outcome(
                    name,
                    Outcome::Failed {
                        message: "ingestion task failed".to_string(),
                    },
                )
            })
        })
        .collect();
    IngestReport { repositories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bushi_core::{ExportedCommit, Repository, ResolvedReference};

    use crate::db::{CommitId, StoredRepository};

    /// Records calls instead of persisting.
    #[derive(Default)]
    struct RecordingStore {
        repositories: Mutex<Vec<String>>,
    }

    impl IndexStore for RecordingStore {
        fn store_repository(&self, repo: &Repository) -> Result<StoredRepository, StoreError> {
            let mut repositories = self.repositories.lock().unwrap();
            repositories.push(repo.name.clone());
            Ok(StoredRepository {
                id: repositories.len() as RepoId,
                repository: repo.clone(),
            })
        }

        fn store_commit(
            &self,
            _repo_id: RepoId,
            _commit: &ExportedCommit,
        ) -> Result<CommitId, StoreError> {
            Ok(1)
        }

        fn store_reference(
            &self,
            _repo_id: RepoId,
            _reference: &ResolvedReference,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// A repository whose path does not exist, so the export fails at spawn.
    fn broken_target(dir: &std::path::Path, name: &str) -> ResolvedRepository {
        ResolvedRepository {
            repository: Repository {
                name: name.to_string(),
                path: dir.join(format!("{name}.git")),
                head: "main".to_string(),
                description: String::new(),
            },
            marks_file: dir.join("marks").join(name),
        }
    }

    #[test]
    fn test_failed_export_reports_repository() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let ingestor = Ingestor::new(Arc::clone(&store), ExportOptions::default());

        let mut report = RepositoryReport::new("gone");
        let err = ingestor
            .try_ingest(&broken_target(dir.path(), "gone"), &mut report)
            .unwrap_err();
        assert!(matches!(err, IngestError::Export { ref repo, .. } if repo == "gone"));
        assert!(err.to_string().starts_with("gone: "));

        // The repository row is written before the export starts.
        assert_eq!(*store.repositories.lock().unwrap(), vec!["gone".to_string()]);
        assert!(dir.path().join("marks").join("gone").exists());
    }

    #[test]
    fn test_report_serializes_outcome() {
        let report = RepositoryReport::with_outcome(
            "r",
            Outcome::Failed {
                message: "boom".to_string(),
            },
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"]["status"], "failed");
        assert_eq!(value["outcome"]["message"], "boom");
        assert_eq!(value["commits"], 0);
    }

    #[tokio::test]
    async fn test_ingest_all_keeps_going_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            Arc::new(RecordingStore::default()),
            ExportOptions::default(),
        ));
        let targets = vec![broken_target(dir.path(), "a"), broken_target(dir.path(), "b")];

        let report = ingest_all(ingestor, targets, 2, false).await;
        let names: Vec<&str> = report.repositories.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(report.failed().count(), 2);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_ingest_all_fail_fast_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            Arc::new(RecordingStore::default()),
            ExportOptions::default(),
        ));
        let targets = vec![broken_target(dir.path(), "a"), broken_target(dir.path(), "b")];

        let report = ingest_all(ingestor, targets, 1, true).await;
        assert!(report.repositories[0].is_failed());
        assert_eq!(report.repositories[1].outcome, Outcome::Skipped);
    }
}
