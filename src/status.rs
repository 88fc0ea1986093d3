//! Operational status of relays and their lanes.
//!
//! Kept in memory, flushed as JSON to a status file that the `status`
//! command reads back.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::RwLock, task::JoinHandle};
use tracing::warn;

use crate::{event::Sequence, event::SourceId, transport::Offset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    #[default]
    Starting,
    Snapshotting,
    Running,
    /// stopped on a fatal error; needs an operator
    Halted,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneState {
    #[default]
    Starting,
    Running,
    Halted,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneStatus {
    pub state: LaneState,
    /// committed transport cursor: next offset to apply
    pub cursor: Option<Offset>,
    pub last_applied: Option<Sequence>,
    pub applied: u64,
    pub duplicates: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub source_id: SourceId,
    pub state: RelayState,
    /// last sequence durably handed to the transport
    pub reader_position: Option<Sequence>,
    pub last_error: Option<String>,
    pub lanes: BTreeMap<u32, LaneStatus>,
    pub updated_at: DateTime<Utc>,
}

impl RelayStatus {
    fn new(source_id: SourceId) -> RelayStatus {
        RelayStatus {
            source_id,
            state: RelayState::Starting,
            reader_position: None,
            last_error: None,
            lanes: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Shared, cloneable handle to the status of every relay
#[derive(Clone, Default)]
pub struct StatusBoard {
    relays: Arc<RwLock<BTreeMap<String, RelayStatus>>>,
    path: Option<PathBuf>,
}

impl StatusBoard {
    pub fn new() -> StatusBoard {
        StatusBoard::default()
    }

    /// Board that `flush` writes to `path`.
    pub fn persisted(path: impl AsRef<Path>) -> StatusBoard {
        StatusBoard {
            relays: Arc::default(),
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub async fn register(&self, relay: &str, source_id: SourceId) {
        self.relays
            .write()
            .await
            .entry(relay.to_owned())
            .or_insert_with(|| RelayStatus::new(source_id));
    }

    /// Applies `f` to the relay's status. Unknown relays are ignored.
    pub async fn update(&self, relay: &str, f: impl FnOnce(&mut RelayStatus)) {
        if let Some(status) = self.relays.write().await.get_mut(relay) {
            f(status);
            status.updated_at = Utc::now();
        }
    }

    pub async fn update_lane(&self, relay: &str, partition: u32, f: impl FnOnce(&mut LaneStatus)) {
        self.update(relay, |status| f(status.lanes.entry(partition).or_default()))
            .await
    }

    pub async fn get(&self, relay: &str) -> Option<RelayStatus> {
        self.relays.read().await.get(relay).cloned()
    }

    pub async fn all(&self) -> BTreeMap<String, RelayStatus> {
        self.relays.read().await.clone()
    }

    /// Writes the board to its status file, if it has one.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&*self.relays.read().await)?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, json)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Flushes every `every` until the task is aborted.
    pub fn flush_periodically(&self, every: Duration) -> JoinHandle<()> {
        let board = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = board.flush().await {
                    warn!("flushing status: {:#}", e);
                }
            }
        })
    }

    /// Reads a status file written by `flush`.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<BTreeMap<String, RelayStatus>> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
