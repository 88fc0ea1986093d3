//! In-process transport. Survives relay restarts as long as the value lives,
//! which is what the recovery tests lean on.
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, LaneConsumer, Offset, Transport};
use crate::{codec::Codec, error::TransportError, event::ChangeEvent};

#[derive(Default)]
struct Partition {
    log: Vec<Vec<u8>>,
    committed: Option<Offset>,
}

struct Shared {
    partitions: Vec<Partition>,
    capacity: Option<usize>,
    fail_appends: u32,
    unavailable: bool,
}

pub struct MemoryTransport {
    codec: Arc<Codec>,
    shared: Arc<Mutex<Shared>>,
    appended: Arc<Notify>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryTransport {
    pub fn new(partitions: u32, codec: Codec) -> MemoryTransport {
        MemoryTransport {
            codec: Arc::new(codec),
            shared: Arc::new(Mutex::new(Shared {
                partitions: (0..partitions.max(1)).map(|_| Partition::default()).collect(),
                capacity: None,
                fail_appends: 0,
                unavailable: false,
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Appends beyond `capacity` messages per partition are refused as full.
    pub fn with_capacity(self, capacity: usize) -> MemoryTransport {
        lock(&self.shared).capacity = Some(capacity);
        self
    }

    /// Fails the next `n` appends as unavailable.
    pub fn fail_next_appends(&self, n: u32) {
        lock(&self.shared).fail_appends = n;
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.shared).unavailable = !available;
    }

    /// Every event appended to a partition, decoded, in order.
    pub fn events(&self, partition: u32) -> Vec<ChangeEvent> {
        let shared = lock(&self.shared);
        shared
            .partitions
            .get(partition as usize)
            .map(|p| {
                p.log
                    .iter()
                    .filter_map(|bytes| self.codec.decode(bytes).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of appended messages over all partitions.
    pub fn len(&self) -> usize {
        lock(&self.shared).partitions.iter().map(|p| p.log.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> String {
        String::from("memory")
    }

    fn partitions(&self) -> u32 {
        lock(&self.shared).partitions.len() as u32
    }

    async fn append(&self, partition: u32, event: &ChangeEvent) -> Result<Offset, TransportError> {
        let bytes = self.codec.encode(event)?;
        let offset = {
            let mut shared = lock(&self.shared);
            if shared.unavailable {
                return Err(TransportError::Unavailable("memory transport offline".into()));
            }
            if shared.fail_appends > 0 {
                shared.fail_appends -= 1;
                return Err(TransportError::Unavailable("injected append failure".into()));
            }
            let capacity = shared.capacity;
            let p = shared
                .partitions
                .get_mut(partition as usize)
                .ok_or(TransportError::UnknownPartition(partition))?;
            if capacity.is_some_and(|c| p.log.len() >= c) {
                return Err(TransportError::Full(partition));
            }
            p.log.push(bytes);
            (p.log.len() - 1) as Offset
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn high_watermark(&self, partition: u32) -> Result<Offset, TransportError> {
        let shared = lock(&self.shared);
        shared
            .partitions
            .get(partition as usize)
            .map(|p| p.log.len() as Offset)
            .ok_or(TransportError::UnknownPartition(partition))
    }

    async fn subscribe(&self, partition: u32) -> Result<Box<dyn LaneConsumer>, TransportError> {
        let position = {
            let shared = lock(&self.shared);
            shared
                .partitions
                .get(partition as usize)
                .ok_or(TransportError::UnknownPartition(partition))?
                .committed
                .unwrap_or(0)
        };
        Ok(Box::new(MemoryLane {
            partition,
            position,
            codec: self.codec.clone(),
            shared: self.shared.clone(),
            appended: self.appended.clone(),
        }))
    }
}

struct MemoryLane {
    partition: u32,
    position: Offset,
    codec: Arc<Codec>,
    shared: Arc<Mutex<Shared>>,
    appended: Arc<Notify>,
}

impl MemoryLane {
    fn take(&mut self, max: usize) -> Result<Vec<Delivery>, TransportError> {
        let raw: Vec<(Offset, Vec<u8>)> = {
            let shared = lock(&self.shared);
            let p = &shared.partitions[self.partition as usize];
            p.log
                .iter()
                .enumerate()
                .skip(self.position as usize)
                .take(max)
                .map(|(i, b)| (i as Offset, b.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(raw.len());
        for (offset, bytes) in raw {
            out.push(Delivery {
                partition: self.partition,
                offset,
                event: self.codec.decode(&bytes)?,
            });
            self.position = offset + 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl LaneConsumer for MemoryLane {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let appended = self.appended.clone();
        let notified = appended.notified();
        let batch = self.take(max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.take(max)
    }

    async fn commit(&mut self, next: Offset) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        let p = &mut shared.partitions[self.partition as usize];
        p.committed = Some(p.committed.map_or(next, |c| c.max(next)));
        Ok(())
    }

    async fn committed(&self) -> Result<Option<Offset>, TransportError> {
        Ok(lock(&self.shared).partitions[self.partition as usize].committed)
    }
}
