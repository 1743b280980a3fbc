//! Branch and tag enumeration with annotated-tag dereferencing.

use std::path::Path;
use std::vec::IntoIter;

use git2::{ObjectType, Oid, Reference, Repository};

use crate::error::{RefError, WalkError};
use crate::git::open_repository;
use crate::model::{ResolvedReference, short_name_for};

/// Result of resolving one reference name.
#[derive(Debug)]
pub enum RefOutcome {
    /// The reference resolves to a commit.
    Found(ResolvedReference),
    /// Not a branch or tag, or it ultimately names a tree or blob.
    Skipped(String),
    /// This reference could not be resolved; the walk continues.
    Failed {
        /// Reference name.
        name: String,
        /// What went wrong.
        error: RefError,
    },
}

/// Walks references of one repository, yielding one [`RefOutcome`] each.
///
/// With no explicit names every reference under `refs/` is visited; the
/// list is read on the first call to `next`. An enumeration failure is
/// yielded once and ends the walk.
pub struct RefWalker {
    repo: Repository,
    explicit: Option<IntoIter<String>>,
    all: Option<IntoIter<String>>,
    finished: bool,
}

impl RefWalker {
    /// Open the repository at `repo_path` and prepare a walk.
    ///
    /// `names` are visited in the given order; an empty list means all
    /// references.
    pub fn open(repo_path: &Path, names: Vec<String>) -> Result<Self, WalkError> {
        let repo = open_repository(repo_path).map_err(|source| WalkError::Open {
            path: repo_path.to_path_buf(),
            source,
        })?;
        let explicit = (!names.is_empty()).then(|| names.into_iter());
        Ok(Self {
            repo,
            explicit,
            all: None,
            finished: false,
        })
    }

    fn next_name(&mut self) -> Result<Option<String>, WalkError> {
        if let Some(names) = self.explicit.as_mut() {
            return Ok(names.next());
        }
        if self.all.is_none() {
            let names = list_reference_names(&self.repo).map_err(WalkError::Enumerate)?;
            tracing::debug!(count = names.len(), "enumerated references");
            self.all = Some(names.into_iter());
        }
        Ok(self.all.as_mut().and_then(Iterator::next))
    }

    /// Resolve one reference by name.
    pub fn resolve(&self, name: &str) -> RefOutcome {
        let failed = |error| RefOutcome::Failed {
            name: name.to_string(),
            error,
        };

        let reference = match self.repo.find_reference(name) {
            Ok(reference) => reference,
            Err(source) => {
                return failed(RefError::Lookup {
                    name: name.to_string(),
                    source,
                });
            }
        };
        if !reference.is_branch() && !reference.is_tag() {
            return RefOutcome::Skipped(name.to_string());
        }
        if !Reference::is_valid_name(name) {
            return failed(RefError::InvalidName(name.to_string()));
        }

        let is_tag = reference.is_tag();
        let shorthand = reference.shorthand().unwrap_or(name).to_string();
        let direct = match reference.resolve() {
            Ok(direct) => direct,
            Err(source) => {
                return failed(RefError::Object {
                    name: name.to_string(),
                    source,
                });
            }
        };
        let Some(target) = direct.target() else {
            return RefOutcome::Skipped(name.to_string());
        };

        match self.peel_to_commit(target) {
            Ok(Some((oid, timestamp))) => RefOutcome::Found(ResolvedReference {
                full_name: name.to_string(),
                short_name: short_name_for(&shorthand),
                is_tag,
                target_oid: oid.to_string(),
                timestamp,
            }),
            Ok(None) => {
                tracing::debug!(reference = name, "reference does not name a commit");
                RefOutcome::Skipped(name.to_string())
            }
            Err(source) => failed(RefError::Object {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Follow tag objects until a commit is reached. Trees and blobs give
    /// `None`.
    fn peel_to_commit(&self, oid: Oid) -> Result<Option<(Oid, i64)>, git2::Error> {
        let mut object = self.repo.find_object(oid, None)?;
        loop {
            match object.kind() {
                Some(ObjectType::Commit) => {
                    return Ok(object
                        .as_commit()
                        .map(|commit| (commit.id(), commit.time().seconds())));
                }
                Some(ObjectType::Tag) => {
                    let target = match object.as_tag() {
                        Some(tag) => tag.target(),
                        None => return Ok(None),
                    };
                    object = target?;
                }
                _ => return Ok(None),
            }
        }
    }
}

fn list_reference_names(repo: &Repository) -> Result<Vec<String>, git2::Error> {
    let mut references = repo.references()?;
    let mut names = Vec::new();
    for name in references.names() {
        names.push(name?.to_string());
    }
    Ok(names)
}

impl Iterator for RefWalker {
    type Item = Result<RefOutcome, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_name() {
            Ok(Some(name)) => Some(Ok(self.resolve(&name))),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Signature, Time};

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Repository,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path().join("repo.git")).unwrap();
        Fixture { _dir: dir, repo }
    }

    fn signature(seconds: i64) -> Signature<'static> {
        Signature::new("Tester", "tester@example.com", &Time::new(seconds, 0)).unwrap()
    }

    fn tree_with(repo: &Repository, name: &str, content: &[u8]) -> Oid {
        let blob = repo.blob(content).unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
        builder.write().unwrap()
    }

    fn commit(repo: &Repository, refname: &str, seconds: i64, parent: Option<Oid>) -> Oid {
        let tree = repo.find_tree(tree_with(repo, "a.txt", b"a")).unwrap();
        let sig = signature(seconds);
        let parent = parent.map(|oid| repo.find_commit(oid).unwrap());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some(refname), &sig, &sig, "msg", &tree, &parents)
            .unwrap()
    }

    fn found(outcome: RefOutcome) -> ResolvedReference {
        match outcome {
            RefOutcome::Found(reference) => reference,
            other => panic!("expected a resolved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_resolves_to_commit() {
        let fx = fixture();
        let oid = commit(&fx.repo, "refs/heads/feature/login", 1_700_000_000, None);
        let walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();

        let reference = found(walker.resolve("refs/heads/feature/login"));
        assert_eq!(reference.short_name, "feature:login");
        assert!(!reference.is_tag);
        assert_eq!(reference.target_oid, oid.to_string());
        assert_eq!(reference.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_annotated_tag_is_dereferenced() {
        let fx = fixture();
        let oid = commit(&fx.repo, "refs/heads/main", 1_700_000_100, None);
        let target = fx.repo.find_object(oid, None).unwrap();
        let tag_oid = fx
            .repo
            .tag("v1.0", &target, &signature(1_800_000_000), "release", false)
            .unwrap();
        assert_ne!(tag_oid, oid);

        let walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();
        let reference = found(walker.resolve("refs/tags/v1.0"));
        assert!(reference.is_tag);
        assert_eq!(reference.short_name, "v1.0");
        assert_eq!(reference.target_oid, oid.to_string());
        // Committer time of the commit, not the tagger time.
        assert_eq!(reference.timestamp, 1_700_000_100);
    }

    #[test]
    fn test_tag_of_tag_is_dereferenced() {
        let fx = fixture();
        let oid = commit(&fx.repo, "refs/heads/main", 1_700_000_000, None);
        let target = fx.repo.find_object(oid, None).unwrap();
        let inner = fx
            .repo
            .tag("inner", &target, &signature(1_700_000_001), "inner", false)
            .unwrap();
        let inner = fx.repo.find_object(inner, None).unwrap();
        fx.repo
            .tag("outer", &inner, &signature(1_700_000_002), "outer", false)
            .unwrap();

        let walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();
        assert_eq!(
            found(walker.resolve("refs/tags/outer")).target_oid,
            oid.to_string()
        );
    }

    #[test]
    fn test_tag_on_tree_is_skipped() {
        let fx = fixture();
        let tree = tree_with(&fx.repo, "t.txt", b"t");
        let tree = fx.repo.find_object(tree, None).unwrap();
        fx.repo
            .tag("tree-tag", &tree, &signature(1_700_000_000), "tree", false)
            .unwrap();

        let mut walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();
        let outcome = walker.next().unwrap().unwrap();
        assert!(matches!(outcome, RefOutcome::Skipped(ref name) if name == "refs/tags/tree-tag"));
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_lightweight_tag_on_blob_is_skipped() {
        let fx = fixture();
        let blob = fx.repo.blob(b"loose").unwrap();
        fx.repo
            .reference("refs/tags/blob", blob, false, "test")
            .unwrap();

        let walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();
        assert!(matches!(
            walker.resolve("refs/tags/blob"),
            RefOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_explicit_names_keep_order_and_unknown_fails() {
        let fx = fixture();
        commit(&fx.repo, "refs/heads/main", 1_700_000_000, None);
        commit(&fx.repo, "refs/heads/dev", 1_700_000_000, None);

        let names = vec![
            "refs/heads/main".to_string(),
            "refs/heads/missing".to_string(),
            "refs/heads/dev".to_string(),
        ];
        let outcomes: Vec<_> = RefWalker::open(fx.repo.path(), names)
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(found_name(&outcomes[0]), Some("main"));
        match &outcomes[1] {
            RefOutcome::Failed { name, error } => {
                assert_eq!(name, "refs/heads/missing");
                assert!(matches!(error, RefError::Lookup { .. }));
                assert_eq!(error.name(), "refs/heads/missing");
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert_eq!(found_name(&outcomes[2]), Some("dev"));
    }

    fn found_name(outcome: &RefOutcome) -> Option<&str> {
        match outcome {
            RefOutcome::Found(reference) => Some(reference.short_name.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_remote_refs_are_skipped() {
        let fx = fixture();
        let oid = commit(&fx.repo, "refs/heads/main", 1_700_000_000, None);
        fx.repo
            .reference("refs/remotes/origin/main", oid, false, "test")
            .unwrap();

        let walker = RefWalker::open(fx.repo.path(), vec![]).unwrap();
        assert!(matches!(
            walker.resolve("refs/remotes/origin/main"),
            RefOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_walk_visits_every_reference() {
        let fx = fixture();
        let root = commit(&fx.repo, "refs/heads/main", 1_700_000_000, None);
        commit(&fx.repo, "refs/heads/topic", 1_700_000_500, Some(root));
        let target = fx.repo.find_object(root, None).unwrap();
        fx.repo
            .tag_lightweight("v0", &target, false)
            .unwrap();

        let mut names: Vec<String> = RefWalker::open(fx.repo.path(), vec![])
            .unwrap()
            .filter_map(|outcome| match outcome.unwrap() {
                RefOutcome::Found(reference) => Some(reference.full_name),
                _ => None,
            })
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["refs/heads/main", "refs/heads/topic", "refs/tags/v0"]
        );
    }

    #[test]
    fn test_open_missing_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = RefWalker::open(&dir.path().join("nope"), vec![]);
        assert!(matches!(result, Err(WalkError::Open { .. })));
    }
}
