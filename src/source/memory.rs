//! In-process change log. Keeps the folded table state so it can snapshot.
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;

use super::{ChangeLog, RawEntry, Snapshot};
use crate::{
    error::SourceError,
    event::{Key, Operation, Sequence},
    normalizer,
};

#[derive(Default)]
struct Inner {
    entries: Vec<RawEntry>,
    purged_through: Option<Sequence>,
    head: Option<Sequence>,
    rows: BTreeMap<Key, Value>,
    unavailable: bool,
}

pub struct MemoryLog {
    primary_key: Vec<String>,
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new(primary_key: Vec<String>) -> MemoryLog {
        MemoryLog {
            primary_key,
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an entry in log order. An entry that does not advance the
    /// head is kept as written; readers reject it as malformed.
    pub fn append(&self, entry: RawEntry) {
        let mut inner = self.lock();
        inner.head = Some(inner.head.map_or(entry.sequence, |h| h.max(entry.sequence)));
        if let Ok(op) = normalizer::operation_of(&entry) {
            if let Ok(key) = normalizer::key_of(&entry, op, &self.primary_key) {
                match (op, &entry.after) {
                    (Operation::Delete, _) => {
                        inner.rows.remove(&key);
                    }
                    (_, Some(after)) => {
                        inner.rows.insert(key, after.clone());
                    }
                    _ => {}
                }
            }
        }
        inner.entries.push(entry);
        drop(inner);
        self.appended.notify_waiters();
    }

    /// Drops every entry with sequence `<= through`.
    pub fn purge_through(&self, through: Sequence) {
        let mut inner = self.lock();
        inner.entries.retain(|e| e.sequence > through);
        inner.purged_through = Some(inner.purged_through.map_or(through, |p| p.max(through)));
    }

    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
        self.appended.notify_waiters();
    }

    pub fn head(&self) -> Option<Sequence> {
        self.lock().head
    }
}

#[async_trait]
impl ChangeLog for MemoryLog {
    fn name(&self) -> String {
        String::from("memory")
    }

    async fn read_after(
        &self,
        after: Option<Sequence>,
        max: usize,
    ) -> Result<Vec<RawEntry>, SourceError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(SourceError::SourceUnavailable("memory log offline".into()));
        }
        // resume right behind the entry last handed out, so entries written
        // out of order are still delivered in log order
        let start = match after {
            None => 0,
            Some(a) => match inner.entries.iter().rposition(|e| e.sequence == a) {
                Some(i) => i + 1,
                None => inner
                    .entries
                    .iter()
                    .position(|e| e.sequence > a)
                    .unwrap_or(inner.entries.len()),
            },
        };
        Ok(inner.entries[start..].iter().take(max).cloned().collect())
    }

    async fn purged_through(&self) -> Result<Option<Sequence>, SourceError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(SourceError::SourceUnavailable("memory log offline".into()));
        }
        Ok(inner.purged_through)
    }

    async fn snapshot(&self) -> Result<Option<Snapshot>, SourceError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(SourceError::SourceUnavailable("memory log offline".into()));
        }
        let as_of = inner.head.unwrap_or(Sequence(0));
        let ts_ms = Utc::now().timestamp_millis();
        let rows = inner
            .rows
            .iter()
            .map(|(key, row)| RawEntry {
                sequence: as_of,
                op: "r".into(),
                key: Some(key.to_value()),
                before: None,
                after: Some(row.clone()),
                ts_ms,
                source: None,
            })
            .collect();
        Ok(Some(Snapshot { as_of, rows }))
    }

    async fn wait_for_entries(&self, after: Option<Sequence>, timeout: Duration) {
        let notified = self.appended.notified();
        {
            let inner = self.lock();
            if inner.entries.last().is_some_and(|e| Some(e.sequence) != after) {
                return;
            }
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }
}
