use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{Checkpoint, CheckpointStore};
use crate::{
    error::CheckpointError,
    event::{Sequence, SourceId},
};

/// Process-local checkpoints. Durable for as long as the value lives.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<SourceId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> MemoryCheckpointStore {
        MemoryCheckpointStore::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &SourceId) -> Result<Option<Sequence>, CheckpointError> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(source_id).map(|c| c.last_applied_sequence))
    }

    async fn save(&self, source_id: &SourceId, sequence: Sequence) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let entry = checkpoints
            .entry(source_id.clone())
            .or_insert_with(|| Checkpoint {
                source_id: source_id.clone(),
                last_applied_sequence: sequence,
                updated_at: Utc::now(),
            });
        if sequence > entry.last_applied_sequence {
            entry.last_applied_sequence = sequence;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset(&self, source_id: &SourceId) -> Result<(), CheckpointError> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut out: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }
}
