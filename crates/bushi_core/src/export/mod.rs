//! Commit export through `git fast-export`.
//!
//! [`spawn_fast_export`] starts the exporter with mark files enabled and
//! returns a [`CommitStream`]. A producer thread parses the exporter's stdout
//! and hands records over a bounded channel, so a slow consumer pauses the
//! exporter instead of buffering the whole history.

mod parser;

pub use parser::FastExportParser;

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::ExportError;
use crate::model::{ExportedCommit, Repository};

/// Tuning for a single export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Records buffered between the producer thread and the consumer.
    pub channel_capacity: usize,
    /// Give up when no record arrives for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            idle_timeout: None,
        }
    }
}

type Item = Result<ExportedCommit, ExportError>;

/// Where one run reads its marks from and writes the new ones to.
#[derive(Debug)]
struct MarkFiles {
    live: PathBuf,
    pending: PathBuf,
}

/// Sibling of `marks_file` that receives the marks of a run in progress.
fn pending_marks_path(marks_file: &Path) -> PathBuf {
    let mut name = marks_file.as_os_str().to_owned();
    name.push(".pending");
    PathBuf::from(name)
}

/// Build the exporter invocation for `repo`.
///
/// Marks of earlier runs are imported from `import_marks` so their commits
/// are not emitted again; the full set, including new marks, is written to
/// `export_marks` when the exporter exits.
fn fast_export_command(repo_path: &Path, import_marks: &Path, export_marks: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_path)
        .arg("fast-export")
        .arg("--signed-tags=strip")
        .arg("--export-marks")
        .arg(export_marks)
        .arg("--import-marks")
        .arg(import_marks)
        .arg("--mark-tags")
        .arg("--fake-missing-tagger")
        .arg("--no-data")
        .arg("--show-original-ids")
        .arg("--reencode=yes")
        .arg("--branches")
        .arg("--tags")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Start exporting `repo` and stream its commits.
///
/// `marks_file` must exist; an empty file means a full export. It is left
/// untouched until [`CommitStream::commit_marks`] is called, so a run that
/// fails part way is exported again by the next one.
pub fn spawn_fast_export(
    repo: &Repository,
    marks_file: &Path,
    options: ExportOptions,
) -> Result<CommitStream, ExportError> {
    let marks = MarkFiles {
        live: marks_file.to_path_buf(),
        pending: pending_marks_path(marks_file),
    };
    // Left behind by an interrupted run.
    match fs::remove_file(&marks.pending) {
        Ok(()) => tracing::debug!(path = %marks.pending.display(), "removed stale pending marks"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ExportError::Marks {
                path: marks.pending,
                source,
            });
        }
    }

    let cmd = fast_export_command(&repo.path, &marks.live, &marks.pending);
    stream_command(cmd, &repo.name, &repo.path, Some(marks), options)
}

/// Spawn `cmd` and parse its stdout on a producer thread.
fn stream_command(
    mut cmd: Command,
    label: &str,
    path: &Path,
    marks: Option<MarkFiles>,
    options: ExportOptions,
) -> Result<CommitStream, ExportError> {
    let mut child = cmd.spawn().map_err(|source| ExportError::Spawn {
        path: path.to_path_buf(),
        source,
    })?;
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(ExportError::MissingStdout);
    };

    tracing::debug!(repo = %label, pid = child.id(), "started git fast-export");

    let child = Arc::new(Mutex::new(child));
    let (tx, rx) = mpsc::sync_channel(options.channel_capacity.max(1));
    let producer_child = Arc::clone(&child);
    let producer = thread::Builder::new()
        .name(format!("fast-export-{label}"))
        .spawn(move || produce(BufReader::new(stdout), producer_child, tx));

    let producer = match producer {
        Ok(handle) => handle,
        Err(err) => {
            kill_child(&child);
            return Err(ExportError::Producer(err.to_string()));
        }
    };

    Ok(CommitStream {
        rx: Some(rx),
        child,
        producer: Some(producer),
        idle_timeout: options.idle_timeout,
        done: false,
        completed: false,
        marks,
    })
}

/// Producer thread body: parse, forward, then reap the exporter.
///
/// The channel is only closed after the exit status is known, so the
/// consumer never mistakes a failed export for a complete one.
fn produce<R: BufRead>(reader: R, child: Arc<Mutex<Child>>, tx: SyncSender<Item>) {
    let mut parser = FastExportParser::new(reader);
    let mut aborted = false;
    for item in parser.by_ref() {
        let failed = item.is_err();
        if tx.send(item).is_err() {
            // Consumer went away.
            aborted = true;
            break;
        }
        if failed {
            aborted = true;
            break;
        }
    }

    if aborted {
        tracing::debug!(lines = parser.line_number(), "export aborted");
        kill_child(&child);
        return;
    }
    tracing::debug!(lines = parser.line_number(), "export stream drained");

    let status = match child.lock() {
        Ok(mut guard) => guard.wait(),
        Err(poisoned) => poisoned.into_inner().wait(),
    };
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let _ = tx.send(Err(ExportError::Exit(status)));
        }
        Err(err) => {
            let _ = tx.send(Err(ExportError::Wait(err)));
        }
    }
}

fn kill_child(child: &Mutex<Child>) {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Ok(None) = guard.try_wait() {
        let _ = guard.kill();
    }
    let _ = guard.wait();
}

/// Lazy, finite sequence of exported commits.
///
/// Ends after the exporter exits successfully, or right after the first
/// error. Dropping the stream early kills the exporter; dropping it without
/// [`commit_marks`](Self::commit_marks) discards the marks of this run.
pub struct CommitStream {
    rx: Option<Receiver<Item>>,
    child: Arc<Mutex<Child>>,
    producer: Option<JoinHandle<()>>,
    idle_timeout: Option<Duration>,
    done: bool,
    completed: bool,
    marks: Option<MarkFiles>,
}

impl CommitStream {
    /// Make the marks written by this run the starting point of the next.
    ///
    /// Call once every yielded commit has been persisted. Fails with
    /// [`ExportError::Unfinished`] unless the stream ran to a successful end.
    pub fn commit_marks(mut self) -> Result<(), ExportError> {
        if !self.completed {
            return Err(ExportError::Unfinished);
        }
        let Some(marks) = self.marks.take() else {
            return Ok(());
        };
        match fs::rename(&marks.pending, &marks.live) {
            Ok(()) => Ok(()),
            // Nothing new was exported, so the live file is still current.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExportError::Marks {
                path: marks.live,
                source,
            }),
        }
    }

    fn join_producer(&mut self) -> Option<ExportError> {
        let handle = self.producer.take()?;
        handle
            .join()
            .err()
            .map(|_| ExportError::Producer("producer thread panicked".to_string()))
    }

    fn finish(&mut self, item: Option<Item>) -> Option<Item> {
        self.done = true;
        item
    }
}

impl Iterator for CommitStream {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_ref()?;

        let received = match self.idle_timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(item) => Ok(item),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(?timeout, "git fast-export stalled; killing it");
                    kill_child(&self.child);
                    return self.finish(Some(Err(ExportError::Stalled(timeout))));
                }
                Err(RecvTimeoutError::Disconnected) => Err(()),
            },
            None => rx.recv().map_err(|_| ()),
        };

        match received {
            Ok(item) => {
                if item.is_err() {
                    self.done = true;
                }
                Some(item)
            }
            Err(()) => {
                let panicked = self.join_producer();
                self.completed = panicked.is_none();
                self.finish(panicked.map(Err))
            }
        }
    }
}

impl Drop for CommitStream {
    fn drop(&mut self) {
        if !self.done {
            kill_child(&self.child);
        }
        // Unblocks a producer stuck on a full channel.
        self.rx.take();
        let _ = self.join_producer();
        if let Some(marks) = self.marks.take() {
            let _ = fs::remove_file(&marks.pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::git::check_git_available;

    fn git_available() -> bool {
        check_git_available().is_ok()
    }

    /// A bare repository with one commit on `main`. Returns its path and the
    /// commit id.
    fn repo_with_commit(dir: &Path) -> (Repository, String) {
        let path = dir.join("repo.git");
        let repo = git2::Repository::init_bare(&path).unwrap();
        let blob = repo.blob(b"hello\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = git2::Signature::new(
            "Tester",
            "tester@example.com",
            &git2::Time::new(1_700_000_000, 0),
        )
        .unwrap();
        let oid = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "c1", &tree, &[])
            .unwrap();
        let repository = Repository {
            name: "repo".to_string(),
            path,
            head: "main".to_string(),
            description: String::new(),
        };
        (repository, oid.to_string())
    }

    fn empty_marks(dir: &Path) -> PathBuf {
        let marks = dir.join("marks");
        fs::write(&marks, "").unwrap();
        marks
    }

    #[cfg(unix)]
    fn shell_stream(script: &str, options: ExportOptions) -> CommitStream {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        stream_command(cmd, "sh", Path::new("."), None, options).unwrap()
    }

    #[cfg(unix)]
    const ONE_COMMIT: &str = r"printf 'commit refs/heads/main\nmark :1\noriginal-oid aaaa\n\n'";

    #[test]
    fn test_command_line() {
        let cmd = fast_export_command(
            Path::new("/srv/repo.git"),
            Path::new("/var/marks/repo"),
            Path::new("/var/marks/repo.pending"),
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert_eq!(args[0], "fast-export");
        assert!(
            args.windows(2)
                .any(|pair| pair[0] == "--export-marks" && pair[1] == "/var/marks/repo.pending")
        );
        assert!(
            args.windows(2)
                .any(|pair| pair[0] == "--import-marks" && pair[1] == "/var/marks/repo")
        );
        for flag in [
            "--no-data",
            "--show-original-ids",
            "--mark-tags",
            "--branches",
            "--tags",
        ] {
            assert!(args.iter().any(|arg| arg == flag), "missing {flag}: {args:?}");
        }
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/srv/repo.git")));
    }

    #[test]
    fn test_pending_marks_path() {
        assert_eq!(
            pending_marks_path(Path::new("/var/marks/linux")),
            PathBuf::from("/var/marks/linux.pending")
        );
    }

    #[test]
    fn test_default_options_wait_forever() {
        let options = ExportOptions::default();
        assert_eq!(options.channel_capacity, 64);
        assert!(options.idle_timeout.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_fatal_after_records() {
        let items: Vec<Item> =
            shell_stream(&format!("{ONE_COMMIT}; exit 3"), ExportOptions::default()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().original_oid, "aaaa");
        match &items[1] {
            Err(ExportError::Exit(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_idle_timeout_kills_stalled_exporter() {
        let started = Instant::now();
        let mut stream = shell_stream(
            "exec sleep 30",
            ExportOptions {
                channel_capacity: 1,
                idle_timeout: Some(Duration::from_millis(100)),
            },
        );
        match stream.next() {
            Some(Err(ExportError::Stalled(timeout))) => {
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected stall, got {other:?}"),
        }
        assert!(stream.next().is_none());
        drop(stream);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_mid_export_kills_exporter() {
        let started = Instant::now();
        let mut stream = shell_stream(
            &format!("{ONE_COMMIT}; exec sleep 30"),
            ExportOptions::default(),
        );
        assert_eq!(stream.next().unwrap().unwrap().mark, 1);

        // The producer only finishes once the exporter's stdout closes.
        drop(stream);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_corrupt_mark_file_is_fatal() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = repo_with_commit(dir.path());
        let marks = dir.path().join("marks");
        fs::write(&marks, "garbage line\n").unwrap();

        let items: Vec<Item> = spawn_fast_export(&repo, &marks, ExportOptions::default())
            .unwrap()
            .collect();
        assert!(
            matches!(items.last(), Some(Err(ExportError::Exit(status))) if !status.success()),
            "{items:?}"
        );
        assert_eq!(fs::read_to_string(&marks).unwrap(), "garbage line\n");
    }

    #[test]
    fn test_marks_move_into_place_on_commit() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, oid) = repo_with_commit(dir.path());
        let marks = empty_marks(dir.path());

        let mut stream = spawn_fast_export(&repo, &marks, ExportOptions::default()).unwrap();
        let commits: Vec<ExportedCommit> = stream.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].original_oid, oid);
        assert!(commits[0].is_root());
        assert_eq!(fs::read_to_string(&marks).unwrap(), "");

        stream.commit_marks().unwrap();
        assert!(fs::read_to_string(&marks).unwrap().contains(&format!(":1 {oid}")));
        assert!(!pending_marks_path(&marks).exists());

        // Nothing new: the live file stays as it is.
        let mut again = spawn_fast_export(&repo, &marks, ExportOptions::default()).unwrap();
        assert_eq!(again.by_ref().count(), 0);
        again.commit_marks().unwrap();
        assert!(fs::read_to_string(&marks).unwrap().contains(&format!(":1 {oid}")));
    }

    #[test]
    fn test_uncommitted_marks_are_discarded() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = repo_with_commit(dir.path());
        let marks = empty_marks(dir.path());
        fs::write(pending_marks_path(&marks), ":9 stale\n").unwrap();

        let mut stream = spawn_fast_export(&repo, &marks, ExportOptions::default()).unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        drop(stream);

        assert_eq!(fs::read_to_string(&marks).unwrap(), "");
        assert!(!pending_marks_path(&marks).exists());

        let items: Vec<Item> = spawn_fast_export(&repo, &marks, ExportOptions::default())
            .unwrap()
            .collect();
        assert_eq!(items.len(), 1, "a discarded run is exported again");
    }

    #[test]
    fn test_commit_marks_requires_drained_stream() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = repo_with_commit(dir.path());
        let marks = empty_marks(dir.path());

        let stream = spawn_fast_export(&repo, &marks, ExportOptions::default()).unwrap();
        assert!(matches!(stream.commit_marks(), Err(ExportError::Unfinished)));
        assert_eq!(fs::read_to_string(&marks).unwrap(), "");
    }
}
