//! Checkpoints as one JSON file per source, replaced atomically
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointStore};
use crate::{
    error::CheckpointError,
    event::{Sequence, SourceId},
};

pub struct FileCheckpointStore {
    dir: PathBuf,
    /// one lock per source so sources never serialize behind each other
    locks: Mutex<HashMap<SourceId, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<FileCheckpointStore, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(FileCheckpointStore {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, source_id: &SourceId) -> Result<PathBuf, CheckpointError> {
        let name = source_id.to_string();
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(CheckpointError::InvalidKey(name));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    async fn lock_for(&self, source_id: &SourceId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(source_id.clone())
            .or_default()
            .clone()
    }

    async fn read(&self, path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, source_id: &SourceId) -> Result<Option<Sequence>, CheckpointError> {
        let path = self.path(source_id)?;
        Ok(self.read(&path).await?.map(|c| c.last_applied_sequence))
    }

    async fn save(&self, source_id: &SourceId, sequence: Sequence) -> Result<(), CheckpointError> {
        let path = self.path(source_id)?;
        let lock = self.lock_for(source_id).await;
        let _guard = lock.lock().await;

        if let Some(current) = self.read(&path).await? {
            if current.last_applied_sequence >= sequence {
                return Ok(());
            }
        }
        let checkpoint = Checkpoint {
            source_id: source_id.clone(),
            last_applied_sequence: sequence,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&checkpoint)?;

        let temp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        fs::rename(&temp, &path).await?;
        #[cfg(unix)]
        {
            // make the rename itself durable
            fs::File::open(&self.dir).await?.sync_all().await?;
        }
        debug!(source = %source_id, sequence = %sequence, "saved checkpoint");
        Ok(())
    }

    async fn reset(&self, source_id: &SourceId) -> Result<(), CheckpointError> {
        let path = self.path(source_id)?;
        let lock = self.lock_for(source_id).await;
        let _guard = lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(source = %source_id, "checkpoint reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(c)) => out.push(c),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "unreadable checkpoint: {e}"),
            }
        }
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> SourceId {
        SourceId::new("inventory", "public", "users")
    }

    #[tokio::test]
    async fn test_lifecycle_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load(&users()).await.unwrap(), None);

        store.save(&users(), Sequence(100)).await.unwrap();
        store.save(&users(), Sequence(200)).await.unwrap();
        // never moves backwards
        store.save(&users(), Sequence(150)).await.unwrap();
        drop(store);

        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load(&users()).await.unwrap(), Some(Sequence(200)));
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.reset(&users()).await.unwrap();
        assert_eq!(store.load(&users()).await.unwrap(), None);
        store.reset(&users()).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sources_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
        let mut tasks = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let id = SourceId::new("db", "public", &format!("t{t}"));
                for seq in 1..=20 {
                    store.save(&id, Sequence(seq * (t + 1))).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        for t in 0..4u64 {
            let id = SourceId::new("db", "public", &format!("t{t}"));
            assert_eq!(store.load(&id).await.unwrap(), Some(Sequence(20 * (t + 1))));
        }
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        let bad = SourceId::new("db", "..", "x/y");
        assert!(matches!(
            store.save(&bad, Sequence(1)).await,
            Err(CheckpointError::InvalidKey(_))
        ));
    }
}
