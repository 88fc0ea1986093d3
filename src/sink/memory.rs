//! In-process sink, either replace-by-key with hard deletes or append-only
//! with delete markers.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{DeleteMode, Sink, SinkRow};
use crate::{
    error::SinkError,
    event::{ChangeEvent, Key, RowImage, Sequence, SourceId},
};

#[derive(Default)]
struct Tables {
    /// per source table and key: the current row (hard) or every row (tombstone)
    rows: BTreeMap<String, BTreeMap<Key, Vec<SinkRow>>>,
    /// sequence of hard-deleted keys, kept so redelivery cannot resurrect them
    deleted: HashMap<(String, Key), Sequence>,
    fail_writes: u32,
    permanent_failure: Option<String>,
    writes: usize,
}

pub struct MemorySink {
    mode: DeleteMode,
    tables: Mutex<Tables>,
}

impl MemorySink {
    pub fn new(mode: DeleteMode) -> MemorySink {
        MemorySink {
            mode,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fails the next `n` writes as transient.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_writes = n;
    }

    /// Fails every write as permanent until cleared with `None`.
    pub fn fail_permanently(&self, reason: Option<&str>) {
        self.lock().permanent_failure = reason.map(str::to_owned);
    }

    /// Successful writes so far
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// State a reader sees: highest-sequence row per key, deleted keys left out.
    pub fn visible(&self, source_id: &SourceId) -> BTreeMap<Key, RowImage> {
        let tables = self.lock();
        let Some(table) = tables.rows.get(&source_id.to_string()) else {
            return BTreeMap::new();
        };
        table
            .iter()
            .filter_map(|(key, rows)| {
                let latest = rows.iter().max_by_key(|r| r.sequence)?;
                if latest.is_deleted {
                    return None;
                }
                latest.after_image.clone().map(|img| (key.clone(), img))
            })
            .collect()
    }

    /// Every stored row of a key, in write order.
    pub fn rows(&self, source_id: &SourceId, key: &Key) -> Vec<SinkRow> {
        self.lock()
            .rows
            .get(&source_id.to_string())
            .and_then(|t| t.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> String {
        String::from("memory")
    }

    fn delete_mode(&self) -> DeleteMode {
        self.mode
    }

    async fn applied_sequences(
        &self,
        source_id: &SourceId,
        keys: &[Key],
    ) -> Result<HashMap<Key, Sequence>, SinkError> {
        let tables = self.lock();
        let table_name = source_id.to_string();
        let table = tables.rows.get(&table_name);
        let mut out = HashMap::new();
        for key in keys {
            let stored = table
                .and_then(|t| t.get(key))
                .and_then(|rows| rows.iter().map(|r| r.sequence).max());
            let deleted = tables.deleted.get(&(table_name.clone(), key.clone())).copied();
            if let Some(seq) = stored.max(deleted) {
                out.insert(key.clone(), seq);
            }
        }
        Ok(out)
    }

    async fn write(&self, events: &[ChangeEvent]) -> Result<(), SinkError> {
        let mut tables = self.lock();
        if let Some(reason) = &tables.permanent_failure {
            return Err(SinkError::Permanent(reason.clone()));
        }
        if tables.fail_writes > 0 {
            tables.fail_writes -= 1;
            return Err(SinkError::Transient("injected write failure".into()));
        }
        for ev in events {
            let row = SinkRow::from(ev);
            let table_name = row.source_table.clone();
            match (self.mode, ev.is_delete()) {
                (DeleteMode::Hard, true) => {
                    if let Some(t) = tables.rows.get_mut(&table_name) {
                        t.remove(&ev.key);
                    }
                    tables.deleted.insert((table_name, ev.key.clone()), ev.sequence);
                }
                (DeleteMode::Hard, false) => {
                    tables.deleted.remove(&(table_name.clone(), ev.key.clone()));
                    tables
                        .rows
                        .entry(table_name)
                        .or_default()
                        .insert(ev.key.clone(), vec![row]);
                }
                (DeleteMode::Tombstone, _) => {
                    tables
                        .rows
                        .entry(table_name)
                        .or_default()
                        .entry(ev.key.clone())
                        .or_default()
                        .push(row);
                }
            }
        }
        tables.writes += 1;
        Ok(())
    }

    async fn live_keys(&self, source_id: &SourceId) -> Result<Vec<Key>, SinkError> {
        Ok(self.visible(source_id).into_keys().collect())
    }
}
