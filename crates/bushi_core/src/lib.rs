//! # `bushi_core`
//!
//! Streaming extraction of a git repository's history for the bushi indexer.
//!
//! The crate exposes the two export surfaces the indexer consumes:
//! 1. [`export`]: runs `git fast-export` and turns its stream into
//!    [`ExportedCommit`] records, parent linkage expressed through marks.
//! 2. [`refs`]: walks branches and tags with `git2`, dereferencing annotated
//!    tags to the commit they point at.
//!
//! Persisting those records is left to the caller.

#![warn(missing_docs)]

/// Error types
pub mod error;

/// Fast-export stream parsing and the export subprocess
pub mod export;

/// Repository helpers: open, validate, name, mark files
pub mod git;

/// Records produced by the export surfaces
pub mod model;

/// Reference walking
pub mod refs;

pub use error::{ExportError, MalformedKind, RefError, WalkError};
pub use export::{CommitStream, ExportOptions, FastExportParser, spawn_fast_export};
pub use model::{ExportedCommit, Mark, Repository, ResolvedReference, short_name_for};
pub use refs::{RefOutcome, RefWalker};
