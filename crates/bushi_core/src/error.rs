use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Fatal failures of one repository's export run.
#[derive(Debug, Error)]
pub enum ExportError {
    /// `git fast-export` could not be started.
    #[error("failed to start git fast-export in {path}: {source}")]
    Spawn {
        /// Control directory the command ran in.
        path: PathBuf,
        /// Underlying spawn error.
        source: io::Error,
    },
    /// The child was spawned without a stdout pipe.
    #[error("git fast-export stdout is not piped")]
    MissingStdout,
    /// Reading the stream failed for a reason other than end of stream.
    #[error("failed to read export stream after line {line}: {source}")]
    Read {
        /// Last complete line read.
        line: usize,
        /// Underlying read error.
        source: io::Error,
    },
    /// The stream does not follow the export format.
    #[error("malformed export stream at line {line}: {kind}")]
    Malformed {
        /// Line where the problem was detected.
        line: usize,
        /// What was wrong.
        kind: MalformedKind,
    },
    /// The exporter exited unsuccessfully after the stream was drained.
    #[error("git fast-export exited with {0}")]
    Exit(ExitStatus),
    /// Waiting for the exporter failed.
    #[error("failed to wait for git fast-export: {0}")]
    Wait(#[source] io::Error),
    /// No record arrived within the idle timeout; the exporter was killed.
    #[error("git fast-export produced nothing for {0:?}")]
    Stalled(Duration),
    /// The exported mark file could not be moved into place.
    #[error("failed to update mark file {path}: {source}")]
    Marks {
        /// Live mark file.
        path: PathBuf,
        /// Underlying filesystem error.
        source: io::Error,
    },
    /// Marks were committed before the stream finished successfully.
    #[error("export stream was not drained to a successful end")]
    Unfinished,
    /// The producer thread could not be started or died unexpectedly.
    #[error("export producer thread failed: {0}")]
    Producer(String),
}

/// The ways an export stream can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKind {
    /// A numeric value (mark or data length) did not parse.
    #[error("invalid {key} value {value:?}")]
    InvalidNumber {
        /// Record key carrying the value.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// An `M` line without a path field.
    #[error("file change without path: {0:?}")]
    MissingPath(String),
    /// A commit record finished without a required field.
    #[error("commit record without {0}")]
    MissingField(&'static str),
    /// The stream ended in the middle of a line.
    #[error("stream ends inside a line")]
    TruncatedLine,
    /// The stream ended before a `data` payload was complete.
    #[error("stream ends {remaining} bytes before the end of a data payload")]
    TruncatedPayload {
        /// Bytes still expected.
        remaining: usize,
    },
}

/// Recoverable failure resolving a single reference.
#[derive(Debug, Error)]
pub enum RefError {
    /// The reference does not exist or could not be read.
    #[error("failed to look up reference {name}: {source}")]
    Lookup {
        /// Requested reference name.
        name: String,
        /// Underlying git error.
        source: git2::Error,
    },
    /// The reference name is not valid.
    #[error("invalid reference name {0:?}")]
    InvalidName(String),
    /// The object the reference points at could not be resolved.
    #[error("failed to resolve target of {name}: {source}")]
    Object {
        /// Reference name.
        name: String,
        /// Underlying git error.
        source: git2::Error,
    },
}

impl RefError {
    /// Name of the reference this error is about.
    pub fn name(&self) -> &str {
        match self {
            RefError::Lookup { name, .. } | RefError::Object { name, .. } => name,
            RefError::InvalidName(name) => name,
        }
    }
}

/// Fatal failure of a reference walk.
#[derive(Debug, Error)]
pub enum WalkError {
    /// The repository could not be opened.
    #[error("failed to open repository {path}: {source}")]
    Open {
        /// Control directory.
        path: PathBuf,
        /// Underlying git error.
        source: git2::Error,
    },
    /// The reference list could not be read.
    #[error("failed to enumerate references: {0}")]
    Enumerate(#[source] git2::Error),
}
