//! Change log kept as a JSON-lines file, tailed while the writer appends.
//!
//! Every line is one [RawEntry]. A writer that truncates old entries away
//! starts the rewritten file with a purge marker line:
//! ```text
//! {"purged_through": 1200}
//! {"sequence": 1210, "op": "u", "after": {"id": 7, "name": "x"}, "ts_ms": 1700000000000}
//! ```
use std::{
    collections::BTreeMap,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader},
    sync::Mutex,
};
use tracing::warn;

use super::{ChangeLog, RawEntry, Snapshot};
use crate::{
    error::SourceError,
    event::{Key, Operation, Sequence},
    normalizer,
};

#[derive(Deserialize)]
struct PurgeMarker {
    purged_through: Sequence,
}

enum Line {
    Purge(Sequence),
    Entry(RawEntry),
}

impl Line {
    /// Errors name what the entry is missing rather than the line kind.
    fn parse(text: &str) -> Result<Line, serde_json::Error> {
        if let Ok(marker) = serde_json::from_str::<PurgeMarker>(text) {
            return Ok(Line::Purge(marker.purged_through));
        }
        serde_json::from_str(text).map(Line::Entry)
    }
}

/// Where the last incremental read stopped, with the lines needed to tell
/// whether the file was rewritten since
#[derive(Default)]
struct Tail {
    offset: u64,
    last: Option<Sequence>,
    first_line: String,
    end_line: String,
}

/// Outcome of one pass over the file
struct Scan {
    /// Offset after the last consumed line
    end: u64,
    /// First line of the file, when the pass started at the top
    first_line: Option<String>,
    /// The consumed line ending at `end`
    end_line: Option<String>,
    /// The pass stopped in front of a line it could not decode
    unreadable: Option<SourceError>,
}

pub struct FileLog {
    path: PathBuf,
    primary_key: Vec<String>,
    tail: Mutex<Tail>,
}

impl FileLog {
    pub fn new(path: impl AsRef<Path>, primary_key: Vec<String>) -> FileLog {
        FileLog {
            path: path.as_ref().to_path_buf(),
            primary_key,
            tail: Mutex::new(Tail::default()),
        }
    }

    fn unavailable(&self, e: std::io::Error) -> SourceError {
        SourceError::SourceUnavailable(format!("{}: {e}", self.path.display()))
    }

    async fn open(&self) -> Result<BufReader<File>, SourceError> {
        let file = File::open(&self.path).await.map_err(|e| self.unavailable(e))?;
        Ok(BufReader::new(file))
    }

    async fn first_line(&self) -> Result<String, SourceError> {
        let mut reader = self.open().await?;
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(line)
    }

    /// True when the file still starts and continues exactly as it did when
    /// `tail` was taken, so reading can resume at its offset.
    async fn unchanged_since(&self, tail: &Tail, len: u64) -> Result<bool, SourceError> {
        let end_len = tail.end_line.len() as u64;
        if len < tail.offset || end_len > tail.offset {
            return Ok(false);
        }
        if self.first_line().await? != tail.first_line {
            return Ok(false);
        }
        let mut reader = self.open().await?;
        reader
            .seek(SeekFrom::Start(tail.offset - end_len))
            .await
            .map_err(|e| self.unavailable(e))?;
        let mut end_line = vec![0; tail.end_line.len()];
        match reader.read_exact(&mut end_line).await {
            Ok(_) => Ok(end_line == tail.end_line.as_bytes()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    /// Reads complete lines starting at `offset`, calling `f` for each entry
    /// until it returns false. Stops in front of a line that does not decode.
    async fn scan<F>(&self, offset: u64, mut f: F) -> Result<Scan, SourceError>
    where
        F: FnMut(RawEntry) -> bool + Send,
    {
        let mut reader = self.open().await?;
        reader
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.unavailable(e))?;
        let mut scan = Scan {
            end: offset,
            first_line: None,
            end_line: None,
            unreadable: None,
        };
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| self.unavailable(e))?;
            // no newline yet: the writer is mid-append
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            if scan.end == 0 {
                scan.first_line = Some(line.clone());
            }
            let text = line.trim();
            if !text.is_empty() {
                match Line::parse(text) {
                    Ok(Line::Entry(entry)) => {
                        if !f(entry) {
                            break;
                        }
                    }
                    Ok(Line::Purge(_)) => {}
                    Err(e) => {
                        scan.unreadable = Some(SourceError::UnreadableEntry {
                            log: self.path.display().to_string(),
                            offset: scan.end,
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
            scan.end += n as u64;
            scan.end_line = Some(line.clone());
        }
        Ok(scan)
    }
}

#[async_trait]
impl ChangeLog for FileLog {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn read_after(
        &self,
        after: Option<Sequence>,
        max: usize,
    ) -> Result<Vec<RawEntry>, SourceError> {
        let mut tail = self.tail.lock().await;
        let len = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| self.unavailable(e))?
            .len();
        // continue from where the previous read stopped unless the caller
        // rewound or the file was rewritten underneath us
        let mut resume = after.is_some() && tail.last == after && tail.offset > 0;
        if resume && !self.unchanged_since(&tail, len).await? {
            warn!(path = %self.path.display(), "change log was rewritten, rescanning from the top");
            resume = false;
        }
        let start = if resume { tail.offset } else { 0 };
        let mut out = Vec::new();
        let scan = self
            .scan(start, |entry| {
                if out.len() >= max {
                    return false;
                }
                if after.map_or(true, |a| entry.sequence > a) {
                    out.push(entry);
                }
                true
            })
            .await?;
        if let Some(e) = scan.unreadable {
            // hand out what precedes the bad line first
            if out.is_empty() {
                return Err(e);
            }
        }
        if !resume {
            tail.first_line = scan.first_line.unwrap_or_default();
            tail.end_line.clear();
        }
        if let Some(end_line) = scan.end_line {
            tail.end_line = end_line;
        }
        tail.offset = scan.end;
        tail.last = out.last().map(|e| e.sequence).or(after);
        Ok(out)
    }

    async fn purged_through(&self) -> Result<Option<Sequence>, SourceError> {
        let line = self.first_line().await?;
        match Line::parse(line.trim()) {
            Ok(Line::Purge(purged_through)) => Ok(Some(purged_through)),
            _ => Ok(None),
        }
    }

    async fn snapshot(&self) -> Result<Option<Snapshot>, SourceError> {
        // without the purged prefix the table state cannot be rebuilt
        if self.purged_through().await?.is_some() {
            return Ok(None);
        }
        let mut rows: BTreeMap<Key, Value> = BTreeMap::new();
        let mut head = None;
        let scan = self.scan(0, |entry| {
            head = Some(head.map_or(entry.sequence, |h: Sequence| h.max(entry.sequence)));
            let Ok(op) = normalizer::operation_of(&entry) else {
                return true;
            };
            let Ok(key) = normalizer::key_of(&entry, op, &self.primary_key) else {
                return true;
            };
            match (op, entry.after) {
                (Operation::Delete, _) => {
                    rows.remove(&key);
                }
                (_, Some(after)) => {
                    rows.insert(key, after);
                }
                _ => {}
            }
            true
        })
        .await?;
        if let Some(e) = scan.unreadable {
            return Err(e);
        }
        let as_of = head.unwrap_or(Sequence(0));
        let ts_ms = chrono::Utc::now().timestamp_millis();
        Ok(Some(Snapshot {
            as_of,
            rows: rows
                .into_iter()
                .map(|(key, row)| RawEntry {
                    sequence: as_of,
                    op: "r".into(),
                    key: Some(key.to_value()),
                    before: None,
                    after: Some(row),
                    ts_ms,
                    source: None,
                })
                .collect(),
        }))
    }

    async fn wait_for_entries(&self, _after: Option<Sequence>, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
