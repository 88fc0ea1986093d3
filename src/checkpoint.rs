//! Per-source record of the last sequence durably applied to the sink
pub mod file;
pub mod memory;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::CheckpointError,
    event::{Sequence, SourceId},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: SourceId,
    pub last_applied_sequence: Sequence,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoints of different sources are independent records; writes to one
/// never wait on or disturb another.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source_id: &SourceId) -> Result<Option<Sequence>, CheckpointError>;

    /// Durable once this returns. A checkpoint never moves backwards: saving
    /// a lower sequence than the stored one keeps the stored one.
    async fn save(&self, source_id: &SourceId, sequence: Sequence) -> Result<(), CheckpointError>;

    /// Forgets the source, so the next start snapshots it again.
    async fn reset(&self, source_id: &SourceId) -> Result<(), CheckpointError>;

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// Sources whose snapshot is still being published. Lanes must not
/// checkpoint such a source: its snapshot rows all carry the same sequence,
/// so a checkpoint taken after the first of them would let a restart skip
/// the rest.
#[derive(Clone, Default)]
pub struct SnapshotFence {
    raised: Arc<Mutex<HashSet<SourceId>>>,
}

impl SnapshotFence {
    pub fn new() -> SnapshotFence {
        SnapshotFence::default()
    }

    pub fn raise(&self, source_id: &SourceId) {
        self.raised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source_id.clone());
    }

    pub fn lower(&self, source_id: &SourceId) {
        self.raised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source_id);
    }

    pub fn is_raised(&self, source_id: &SourceId) -> bool {
        self.raised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(source_id)
    }
}

/// Store handed to lanes: saves of fenced sources are dropped.
pub struct FencedStore {
    inner: Arc<dyn CheckpointStore>,
    fence: SnapshotFence,
}

impl FencedStore {
    pub fn new(inner: Arc<dyn CheckpointStore>, fence: SnapshotFence) -> FencedStore {
        FencedStore { inner, fence }
    }
}

#[async_trait]
impl CheckpointStore for FencedStore {
    async fn load(&self, source_id: &SourceId) -> Result<Option<Sequence>, CheckpointError> {
        self.inner.load(source_id).await
    }

    async fn save(&self, source_id: &SourceId, sequence: Sequence) -> Result<(), CheckpointError> {
        if self.fence.is_raised(source_id) {
            debug!(source = %source_id, sequence = %sequence, "snapshot in progress, checkpoint held back");
            return Ok(());
        }
        self.inner.save(source_id, sequence).await
    }

    async fn reset(&self, source_id: &SourceId) -> Result<(), CheckpointError> {
        self.inner.reset(source_id).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.inner.list().await
    }
}
