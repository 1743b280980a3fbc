//! Decoder for the `git fast-export` stream.
//!
//! The stream is line oriented (`<key> SP <value> LF`) except for `data`
//! payloads, which are raw byte blobs of a declared length. Only the keys
//! needed to rebuild commit linkage are interpreted; everything else is
//! skipped so newer exporter output keeps parsing.

use std::io::BufRead;
use std::mem;

use indexmap::IndexSet;

use crate::error::{ExportError, MalformedKind};
use crate::model::{ExportedCommit, Mark};

/// Fields accumulated for the record currently being read.
#[derive(Debug, Default)]
struct RecordState {
    is_commit: bool,
    mark: Mark,
    original_oid: String,
    parent_mark: Mark,
    paths: IndexSet<String>,
}

impl RecordState {
    fn into_commit(self, line: usize) -> Result<ExportedCommit, ExportError> {
        if self.mark == 0 {
            return Err(ExportError::Malformed {
                line,
                kind: MalformedKind::MissingField("mark"),
            });
        }
        if self.original_oid.is_empty() {
            return Err(ExportError::Malformed {
                line,
                kind: MalformedKind::MissingField("original-oid"),
            });
        }
        Ok(ExportedCommit {
            mark: self.mark,
            original_oid: self.original_oid,
            parent_mark: (self.parent_mark != 0).then_some(self.parent_mark),
            files: self.paths.into_iter().collect(),
        })
    }
}

/// Incremental parser yielding one [`ExportedCommit`] per commit record.
///
/// The iterator is finite and not restartable: it ends at end of stream, or
/// right after the first error it reports.
pub struct FastExportParser<R> {
    reader: R,
    line: Vec<u8>,
    line_number: usize,
    state: RecordState,
    pending_skip: usize,
    after_payload: bool,
    finished: bool,
}

impl<R: BufRead> FastExportParser<R> {
    /// Wrap a buffered reader positioned at the start of an export stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(256),
            line_number: 0,
            state: RecordState::default(),
            pending_skip: 0,
            after_payload: false,
            finished: false,
        }
    }

    /// Number of complete lines consumed so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Discard the rest of a `data` payload, then its optional trailing LF.
    ///
    /// Short reads are fine: whatever is still owed stays in `pending_skip`
    /// until the reader hands out more bytes.
    fn skip_payload(&mut self) -> Result<(), ExportError> {
        while self.pending_skip > 0 {
            let available = self.reader.fill_buf().map_err(|source| ExportError::Read {
                line: self.line_number,
                source,
            })?;
            if available.is_empty() {
                return Err(self.malformed(MalformedKind::TruncatedPayload {
                    remaining: self.pending_skip,
                }));
            }
            let n = available.len().min(self.pending_skip);
            self.reader.consume(n);
            self.pending_skip -= n;
        }

        if mem::take(&mut self.after_payload) {
            let available = self.reader.fill_buf().map_err(|source| ExportError::Read {
                line: self.line_number,
                source,
            })?;
            if available.first() == Some(&b'\n') {
                self.reader.consume(1);
            }
        }
        Ok(())
    }

    /// Close the current record, returning it when it was a commit.
    fn finish_record(&mut self) -> Option<Result<ExportedCommit, ExportError>> {
        let state = mem::take(&mut self.state);
        state
            .is_commit
            .then(|| state.into_commit(self.line_number))
    }

    fn malformed(&self, kind: MalformedKind) -> ExportError {
        ExportError::Malformed {
            line: self.line_number,
            kind,
        }
    }

    fn parse_number<T: std::str::FromStr>(
        &self,
        key: &'static str,
        value: &[u8],
    ) -> Result<T, ExportError> {
        let text = String::from_utf8_lossy(value);
        text.trim_start_matches(':').parse::<T>().map_err(|_| {
            self.malformed(MalformedKind::InvalidNumber {
                key,
                value: text.to_string(),
            })
        })
    }

    /// Extract the path of `M <mode> <dataref> <path>`.
    fn parse_path(&self, value: &[u8]) -> Result<String, ExportError> {
        let mut parts = value.splitn(3, |b| *b == b' ');
        let path = parts.nth(2).filter(|p| !p.is_empty()).ok_or_else(|| {
            self.malformed(MalformedKind::MissingPath(
                String::from_utf8_lossy(value).to_string(),
            ))
        })?;
        let path = if path.first() == Some(&b'"') {
            unquote_c_style(path)
        } else {
            path.to_vec()
        };
        Ok(String::from_utf8_lossy(&path).into_owned())
    }

    fn next_record(&mut self) -> Result<Option<ExportedCommit>, ExportError> {
        loop {
            self.skip_payload()?;

            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|source| ExportError::Read {
                    line: self.line_number,
                    source,
                })?;
            if read == 0 {
                return self.finish_record().transpose();
            }
            if self.line.last() != Some(&b'\n') {
                return Err(self.malformed(MalformedKind::TruncatedLine));
            }
            self.line_number += 1;

            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }

            if self.line.is_empty() {
                match self.finish_record() {
                    Some(commit) => return commit.map(Some),
                    None => continue,
                }
            }

            let line = mem::take(&mut self.line);
            let result = self.apply_line(&line);
            self.line = line;
            if let Some(commit) = result? {
                return Ok(Some(commit));
            }
        }
    }

    /// Fold one non-empty line into the state. Returns a commit when the
    /// line opened a new record while a commit was still open.
    fn apply_line(&mut self, line: &[u8]) -> Result<Option<ExportedCommit>, ExportError> {
        let (key, value) = match line.iter().position(|b| *b == b' ') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, &line[line.len()..]),
        };

        match key {
            b"commit" | b"tag" | b"reset" | b"blob" => {
                let open = self.finish_record().transpose()?;
                self.state.is_commit = key == b"commit";
                return Ok(open);
            }
            b"data" => {
                self.pending_skip = self.parse_number("data", value)?;
                self.after_payload = true;
            }
            b"mark" if self.state.is_commit => {
                self.state.mark = self.parse_number("mark", value)?;
            }
            b"from" if self.state.is_commit => {
                self.state.parent_mark = self.parse_number("from", value)?;
            }
            b"original-oid" => {
                self.state.original_oid = String::from_utf8_lossy(value).into_owned();
            }
            b"M" => {
                let path = self.parse_path(value)?;
                self.state.paths.insert(path);
            }
            _ => {}
        }
        Ok(None)
    }
}

impl<R: BufRead> Iterator for FastExportParser<R> {
    type Item = Result<ExportedCommit, ExportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(commit)) => Some(Ok(commit)),
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

/// Undo git's C-style path quoting (`"dir/with \"quote\"\303\251"`).
fn unquote_c_style(quoted: &[u8]) -> Vec<u8> {
    let inner = quoted
        .strip_prefix(b"\"")
        .and_then(|q| q.strip_suffix(b"\""))
        .unwrap_or(quoted);

    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        i += 1;
        if b != b'\\' || i >= inner.len() {
            out.push(b);
            continue;
        }
        let escaped = inner[i];
        i += 1;
        match escaped {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'0'..=b'3' => {
                let digits = &inner[i - 1..inner.len().min(i + 2)];
                if digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                    let value = digits
                        .iter()
                        .fold(0u8, |acc, d| acc.wrapping_mul(8).wrapping_add(d - b'0'));
                    out.push(value);
                    i += 2;
                } else {
                    out.push(escaped);
                }
            }
            other => out.push(other),
        }
    }
    out
}
