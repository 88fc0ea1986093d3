//! Log reader: attaches to a source change log and hands out raw entries
//! strictly after a resume position, one at a time, in log order.
pub mod file;
pub mod memory;

use std::{
    collections::{HashSet, VecDeque},
    fs::{File, OpenOptions, TryLockError},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::SourceError,
    event::{Sequence, SourceId},
};

/// Origin block of a raw entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSource {
    pub db: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

/// One decoded row change as the source log exposes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub sequence: Sequence,
    /// c / u / d / r, or the spelled-out names
    pub op: String,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    /// commit time, milliseconds since epoch
    pub ts_ms: i64,
    #[serde(default)]
    pub source: Option<RawSource>,
}

/// Current rows of a source, consistent as of `as_of`
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub as_of: Sequence,
    pub rows: Vec<RawEntry>,
}

/// A source change log backend
#[async_trait]
pub trait ChangeLog: Send + Sync {
    fn name(&self) -> String;

    /// Up to `max` entries following `after`, in log order. Backends resume
    /// right behind the entry last handed out at `after`; without one they
    /// return entries with a greater sequence.
    async fn read_after(
        &self,
        after: Option<Sequence>,
        max: usize,
    ) -> Result<Vec<RawEntry>, SourceError>;

    /// Highest sequence the source has removed from its log, if any.
    async fn purged_through(&self) -> Result<Option<Sequence>, SourceError>;

    /// Current rows of the source. `None` when the backend cannot produce one.
    async fn snapshot(&self) -> Result<Option<Snapshot>, SourceError>;

    /// Suspends until entries after `after` may exist, or `timeout` elapses.
    async fn wait_for_entries(&self, after: Option<Sequence>, timeout: Duration);
}

/// Tracks which sources currently have an open reader. With a lock
/// directory, a reader also holds an exclusive lock on
/// `<dir>/<source>.lock`, which keeps other processes off the source.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    active: Arc<Mutex<HashSet<SourceId>>>,
    lock_dir: Option<Arc<PathBuf>>,
}

impl ReaderRegistry {
    pub fn new() -> ReaderRegistry {
        ReaderRegistry::default()
    }

    pub fn with_lock_dir(dir: impl AsRef<Path>) -> std::io::Result<ReaderRegistry> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(ReaderRegistry {
            active: Arc::default(),
            lock_dir: Some(Arc::new(dir.as_ref().to_path_buf())),
        })
    }

    pub fn acquire(&self, source_id: &SourceId) -> Result<ReaderLease, SourceError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains(source_id) {
            return Err(SourceError::DuplicateReader(source_id.clone()));
        }
        let lock = match &self.lock_dir {
            Some(dir) => Some(lock_source(dir, source_id)?),
            None => None,
        };
        active.insert(source_id.clone());
        Ok(ReaderLease {
            source_id: source_id.clone(),
            active: self.active.clone(),
            _lock: lock,
        })
    }

    pub fn is_active(&self, source_id: &SourceId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(source_id)
    }
}

fn lock_source(dir: &Path, source_id: &SourceId) -> Result<File, SourceError> {
    let name: String = source_id
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let path = dir.join(format!("{name}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| SourceError::SourceUnavailable(format!("{}: {e}", path.display())))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => {
            warn!(source = %source_id, lock = %path.display(), "source is locked by another process");
            Err(SourceError::DuplicateReader(source_id.clone()))
        }
        Err(TryLockError::Error(e)) => Err(SourceError::SourceUnavailable(format!(
            "{}: {e}",
            path.display()
        ))),
    }
}

/// Released when dropped
pub struct ReaderLease {
    source_id: SourceId,
    active: Arc<Mutex<HashSet<SourceId>>>,
    _lock: Option<File>,
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.source_id);
    }
}

pub struct LogReader {
    log: Arc<dyn ChangeLog>,
    registry: ReaderRegistry,
    poll_interval: Duration,
    fetch_size: usize,
}

impl LogReader {
    pub fn new(log: Arc<dyn ChangeLog>, registry: ReaderRegistry) -> LogReader {
        LogReader {
            log,
            registry,
            poll_interval: Duration::from_millis(500),
            fetch_size: 256,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> LogReader {
        self.poll_interval = poll_interval;
        self
    }

    pub fn log(&self) -> &Arc<dyn ChangeLog> {
        &self.log
    }

    /// Current rows of the source, taken while holding the source's reader lease.
    pub async fn snapshot(&self, source_id: &SourceId) -> Result<Option<Snapshot>, SourceError> {
        let _lease = self.registry.acquire(source_id)?;
        self.log.snapshot().await
    }

    /// Opens a stream emitting entries strictly after `resume`.
    pub async fn open(
        &self,
        source_id: &SourceId,
        resume: Option<Sequence>,
    ) -> Result<LogStream, SourceError> {
        let lease = self.registry.acquire(source_id)?;
        check_retained(self.log.as_ref(), source_id, resume).await?;
        info!(source = %source_id, log = %self.log.name(), resume = ?resume, "opened change log");
        Ok(LogStream {
            log: self.log.clone(),
            source_id: source_id.clone(),
            position: resume,
            buffer: VecDeque::new(),
            poll_interval: self.poll_interval,
            fetch_size: self.fetch_size,
            _lease: lease,
        })
    }
}

async fn check_retained(
    log: &dyn ChangeLog,
    source_id: &SourceId,
    position: Option<Sequence>,
) -> Result<(), SourceError> {
    if let Some(purged) = log.purged_through().await? {
        if position.map_or(true, |p| p < purged) {
            return Err(SourceError::SequenceGone {
                source_id: source_id.clone(),
                resume: position,
                purged_through: purged,
            });
        }
    }
    Ok(())
}

/// Single-lane cursor over one source's log
pub struct LogStream {
    log: Arc<dyn ChangeLog>,
    source_id: SourceId,
    position: Option<Sequence>,
    buffer: VecDeque<RawEntry>,
    poll_interval: Duration,
    fetch_size: usize,
    _lease: ReaderLease,
}

impl LogStream {
    /// Sequence of the last entry handed out (or the resume position).
    /// Entries come out in log order; the caller rejects any that do not
    /// advance past what it already accepted.
    pub fn position(&self) -> Option<Sequence> {
        self.position
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Next entry, suspending until one is available.
    pub async fn next(&mut self) -> Result<RawEntry, SourceError> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.position = Some(entry.sequence);
                return Ok(entry);
            }
            let batch = self.log.read_after(self.position, self.fetch_size).await?;
            // a purge racing the read may have removed entries we never saw
            check_retained(self.log.as_ref(), &self.source_id, self.position).await?;
            if batch.is_empty() {
                self.log
                    .wait_for_entries(self.position, self.poll_interval)
                    .await;
                continue;
            }
            debug!(source = %self.source_id, entries = batch.len(), "fetched from change log");
            self.buffer.extend(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryLog;
    use super::*;
    use serde_json::json;

    fn users() -> SourceId {
        SourceId::new("inventory", "public", "users")
    }

    fn log_with(n: u64) -> Arc<MemoryLog> {
        let log = Arc::new(MemoryLog::new(vec!["id".into()]));
        for seq in 1..=n {
            log.append(RawEntry {
                sequence: Sequence(seq * 10),
                op: "c".into(),
                key: None,
                before: None,
                after: Some(json!({"id": seq, "name": format!("u{seq}")})),
                ts_ms: 1_700_000_000_000,
                source: None,
            });
        }
        log
    }

    #[tokio::test]
    async fn test_stream_starts_strictly_after_resume() {
        let log = log_with(5);
        let reader = LogReader::new(log, ReaderRegistry::new());
        let mut stream = reader.open(&users(), Some(Sequence(20))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, Sequence(30));
        assert_eq!(stream.next().await.unwrap().sequence, Sequence(40));
        assert_eq!(stream.position(), Some(Sequence(40)));
    }

    #[tokio::test]
    async fn test_second_reader_is_rejected_until_first_drops() {
        let log = log_with(1);
        let registry = ReaderRegistry::new();
        let reader = LogReader::new(log, registry.clone());
        let first = reader.open(&users(), None).await.unwrap();
        match reader.open(&users(), None).await {
            Err(SourceError::DuplicateReader(id)) => assert_eq!(id, users()),
            other => panic!("expected DuplicateReader, got {:?}", other.err()),
        }
        drop(first);
        assert!(!registry.is_active(&users()));
        assert!(reader.open(&users(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_file_keeps_a_second_process_off_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let here = ReaderRegistry::with_lock_dir(dir.path()).unwrap();
        let elsewhere = ReaderRegistry::with_lock_dir(dir.path()).unwrap();

        let lease = here.acquire(&users()).unwrap();
        assert!(dir.path().join("inventory.public.users.lock").exists());
        match elsewhere.acquire(&users()) {
            Err(SourceError::DuplicateReader(id)) => assert_eq!(id, users()),
            other => panic!("expected DuplicateReader, got {:?}", other.err()),
        }
        assert!(!elsewhere.is_active(&users()));
        // other sources are not affected
        let orders = SourceId::new("shop", "public", "orders");
        assert!(elsewhere.acquire(&orders).is_ok());

        drop(lease);
        assert!(elsewhere.acquire(&users()).is_ok());
    }

    #[tokio::test]
    async fn test_purged_resume_is_sequence_gone() {
        let log = log_with(5);
        log.purge_through(Sequence(30));
        let reader = LogReader::new(log, ReaderRegistry::new());
        match reader.open(&users(), Some(Sequence(20))).await {
            Err(SourceError::SequenceGone { purged_through, .. }) => {
                assert_eq!(purged_through, Sequence(30))
            }
            other => panic!("expected SequenceGone, got {:?}", other.err()),
        }
        let mut stream = reader.open(&users(), Some(Sequence(30))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, Sequence(40));
    }

    #[tokio::test]
    async fn test_unavailable_log_surfaces_transient_error() {
        let log = log_with(2);
        let reader = LogReader::new(log.clone(), ReaderRegistry::new());
        let mut stream = reader.open(&users(), None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, Sequence(10));
        assert_eq!(stream.next().await.unwrap().sequence, Sequence(20));
        log.set_available(false);
        let err = stream.next().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stream_hands_out_regressing_entries_in_log_order() {
        let log = log_with(2);
        let stale = log.read_after(None, 1).await.unwrap().remove(0);
        log.append(stale);
        log.append(RawEntry {
            sequence: Sequence(30),
            ..log.read_after(None, 1).await.unwrap().remove(0)
        });
        let reader = LogReader::new(log, ReaderRegistry::new());
        let mut stream = reader.open(&users(), None).await.unwrap();
        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(stream.next().await.unwrap().sequence.0);
        }
        assert_eq!(seqs, vec![10, 20, 10, 30]);
        assert_eq!(stream.position(), Some(Sequence(30)));
    }

    #[tokio::test]
    async fn test_stream_blocks_until_append() {
        let log = log_with(0);
        let reader = LogReader::new(log.clone(), ReaderRegistry::new())
            .with_poll_interval(Duration::from_millis(10));
        let mut stream = reader.open(&users(), None).await.unwrap();
        let pending = tokio::spawn(async move { stream.next().await.map(|e| e.sequence) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());
        log.append(RawEntry {
            sequence: Sequence(7),
            op: "c".into(),
            key: Some(json!(1)),
            before: None,
            after: Some(json!({"id": 1})),
            ts_ms: 0,
            source: None,
        });
        assert_eq!(pending.await.unwrap().unwrap(), Sequence(7));
    }
}
