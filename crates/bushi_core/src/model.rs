use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Exporter-assigned commit identifier, valid within one mark file.
///
/// `git fast-export` numbers objects with 32-bit marks; 0 never names an
/// object and stands for "no parent".
pub type Mark = u32;

/// A configured repository, as handed to the export surfaces and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    /// Unique display name, also the mark file name.
    pub name: String,
    /// Absolute path to the control directory (bare repo or `.git`).
    pub path: PathBuf,
    /// Default branch shown by the frontend.
    pub head: String,
    /// Free-form description.
    pub description: String,
}

/// One commit record decoded from the export stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedCommit {
    /// Mark assigned by the exporter.
    pub mark: Mark,
    /// Content hash as reported by `original-oid`.
    pub original_oid: String,
    /// Mark of the first parent, `None` for a root commit.
    pub parent_mark: Option<Mark>,
    /// Paths touched by the commit, deduplicated, in stream order.
    pub files: Vec<String>,
}

impl ExportedCommit {
    /// Whether the commit has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_mark.is_none()
    }
}

impl fmt::Display for ExportedCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mark: {:>7}, from: {}, files: {}",
            self.original_oid,
            self.mark,
            self.parent_mark.unwrap_or_default(),
            self.files.len()
        )
    }
}

/// A branch or tag bound to the commit it ultimately points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    /// Qualified name, e.g. `refs/heads/main`.
    pub full_name: String,
    /// Display name usable as a single path segment, e.g. `feature:login`.
    pub short_name: String,
    /// `true` for `refs/tags/*`.
    pub is_tag: bool,
    /// Hex id of the target commit (annotated tags already dereferenced).
    pub target_oid: String,
    /// Committer time of the target commit, epoch seconds.
    pub timestamp: i64,
}

/// Turn a reference shorthand into a path-segment-safe display name.
///
/// Slashes become colons, so `feature/login` is shown as `feature:login`.
pub fn short_name_for(shorthand: &str) -> String {
    shorthand.replace('/', ":")
}
