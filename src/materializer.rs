//! Materializer: one worker per transport partition.
//!
//! Each batch goes through the same steps, strictly in order:
//! 1. drop redelivered events (sequence at or below what the sink already
//!    holds for the key),
//! 2. validate the rest against the declared table schema,
//! 3. write them to the sink as one write,
//! 4. save the source checkpoint,
//! 5. commit the lane cursor past the batch.
//!
//! A crash between any two steps replays the batch on restart, and step 1
//! turns the replay into a no-op.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use tokio::{sync::watch, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::CheckpointStore,
    error::RelayError,
    event::{ChangeEvent, Key, Sequence, SourceId},
    retry::Backoff,
    sink::{Sink, TableSchema},
    status::{LaneState, StatusBoard},
    transport::{Delivery, LaneConsumer, Offset},
};

/// Why a lane stopped
#[derive(Debug)]
pub enum LaneExit {
    Shutdown,
    Halted(RelayError),
}

/// What one applied batch did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub duplicates: usize,
    pub cursor: Offset,
    pub last_applied: Option<Sequence>,
}

pub struct Lane {
    relay: String,
    consumer: Box<dyn LaneConsumer>,
    sink: Arc<dyn Sink>,
    checkpoints: Arc<dyn CheckpointStore>,
    schema: Arc<TableSchema>,
    status: StatusBoard,
    batch_size: usize,
    batch_timeout: Duration,
    backoff: Backoff,
    shutdown: watch::Receiver<bool>,
}

impl Lane {
    pub fn new(
        relay: &str,
        consumer: Box<dyn LaneConsumer>,
        sink: Arc<dyn Sink>,
        checkpoints: Arc<dyn CheckpointStore>,
        schema: Arc<TableSchema>,
        status: StatusBoard,
        shutdown: watch::Receiver<bool>,
    ) -> Lane {
        Lane {
            relay: relay.to_owned(),
            consumer,
            sink,
            checkpoints,
            schema,
            status,
            batch_size: 1000,
            batch_timeout: Duration::from_secs(10),
            backoff: Backoff::unbounded(),
            shutdown,
        }
    }

    pub fn with_batching(mut self, batch_size: usize, batch_timeout: Duration) -> Lane {
        self.batch_size = batch_size.max(1);
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Lane {
        self.backoff = backoff;
        self
    }

    pub fn partition(&self) -> u32 {
        self.consumer.partition()
    }

    /// Runs until shutdown or a permanent failure.
    pub async fn run(mut self) -> LaneExit {
        let partition = self.partition();
        let cursor = self.consumer.committed().await.ok().flatten();
        self.status
            .update_lane(&self.relay, partition, |l| {
                l.state = LaneState::Running;
                l.cursor = cursor;
            })
            .await;
        info!(relay = %self.relay, partition, cursor = ?cursor, "lane started");

        let exit = loop {
            if *self.shutdown.borrow() {
                break LaneExit::Shutdown;
            }
            let batch = tokio::select! {
                batch = self.consumer.next_batch(self.batch_size, self.batch_timeout) => batch,
                _ = self.shutdown.changed() => break LaneExit::Shutdown,
            };
            let batch = match batch {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    if self.pause(1, "receive", &e).await.is_err() {
                        break LaneExit::Shutdown;
                    }
                    continue;
                }
                Err(e) => break LaneExit::Halted(e.into()),
            };
            match self.apply(&batch).await {
                Ok(outcome) => {
                    self.status
                        .update_lane(&self.relay, partition, |l| {
                            l.cursor = Some(outcome.cursor);
                            l.last_applied = outcome.last_applied.or(l.last_applied);
                            l.applied += outcome.applied as u64;
                            l.duplicates += outcome.duplicates as u64;
                            l.last_error = None;
                        })
                        .await;
                }
                Err(exit) => break exit,
            }
        };

        match &exit {
            LaneExit::Shutdown => {
                info!(relay = %self.relay, partition, "lane stopped");
                self.status
                    .update_lane(&self.relay, partition, |l| l.state = LaneState::Stopped)
                    .await;
            }
            LaneExit::Halted(e) => {
                error!(relay = %self.relay, partition, "lane halted: {}", e);
                let msg = e.to_string();
                self.status
                    .update_lane(&self.relay, partition, |l| {
                        l.state = LaneState::Halted;
                        l.last_error = Some(msg);
                    })
                    .await;
            }
        }
        exit
    }

    /// Applies one batch of deliveries in delivery order.
    pub async fn apply(&mut self, batch: &[Delivery]) -> Result<BatchOutcome, LaneExit> {
        let Some(last) = batch.last() else {
            return Ok(BatchOutcome::default());
        };
        let cursor = last.offset + 1;

        let fresh = self.deduplicate(batch).await?;
        let duplicates = batch.len() - fresh.len();

        for ev in &fresh {
            if let Some(image) = &ev.after_image {
                self.schema
                    .check(image)
                    .map_err(|e| LaneExit::Halted(e.into()))?;
            }
        }

        let mut attempts = 0;
        while !fresh.is_empty() {
            match self.sink.write(&fresh).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "sink write", &e).await?;
                }
                Err(e) => return Err(LaneExit::Halted(e.into())),
            }
        }

        // the sink now holds everything up to these sequences
        let mut reached: HashMap<&SourceId, Sequence> = HashMap::new();
        for d in batch {
            let seq = reached.entry(&d.event.source_id).or_insert(d.event.sequence);
            *seq = (*seq).max(d.event.sequence);
        }
        for (source_id, sequence) in reached {
            let mut attempts = 0;
            loop {
                match self.checkpoints.save(source_id, sequence).await {
                    Ok(()) => break,
                    Err(e) => {
                        let e = RelayError::from(e);
                        if !e.is_transient() {
                            return Err(LaneExit::Halted(e));
                        }
                        attempts += 1;
                        self.pause(attempts, "checkpoint save", &e).await?;
                    }
                }
            }
        }

        let mut attempts = 0;
        loop {
            match self.consumer.commit(cursor).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "cursor commit", &e).await?;
                }
                Err(e) => return Err(LaneExit::Halted(e.into())),
            }
        }

        debug!(
            relay = %self.relay,
            partition = self.partition(),
            applied = fresh.len(),
            duplicates,
            cursor,
            "batch applied"
        );
        Ok(BatchOutcome {
            applied: fresh.len(),
            duplicates,
            cursor,
            last_applied: fresh.iter().map(|e| e.sequence).max(),
        })
    }

    /// Events of the batch newer than anything the sink or an earlier event
    /// of the same batch holds for their key.
    async fn deduplicate(&mut self, batch: &[Delivery]) -> Result<Vec<ChangeEvent>, LaneExit> {
        let mut by_source: HashMap<&SourceId, HashSet<&Key>> = HashMap::new();
        for d in batch {
            by_source
                .entry(&d.event.source_id)
                .or_default()
                .insert(&d.event.key);
        }

        let mut seen: HashMap<(SourceId, Key), Sequence> = HashMap::new();
        for (source_id, keys) in by_source {
            let keys: Vec<Key> = keys.into_iter().cloned().collect();
            let mut attempts = 0;
            let applied = loop {
                match self.sink.applied_sequences(source_id, &keys).await {
                    Ok(applied) => break applied,
                    Err(e) if e.is_transient() => {
                        attempts += 1;
                        self.pause(attempts, "sink lookup", &e).await?;
                    }
                    Err(e) => return Err(LaneExit::Halted(e.into())),
                }
            };
            for (key, seq) in applied {
                seen.insert((source_id.clone(), key), seq);
            }
        }

        let mut fresh = Vec::with_capacity(batch.len());
        for d in batch {
            let ev = &d.event;
            let slot = (ev.source_id.clone(), ev.key.clone());
            if seen.get(&slot).is_some_and(|applied| ev.sequence <= *applied) {
                debug!(
                    source = %ev.source_id,
                    key = %ev.key,
                    sequence = %ev.sequence,
                    offset = d.offset,
                    "skipping redelivered event"
                );
                continue;
            }
            seen.insert(slot, ev.sequence);
            fresh.push(ev.clone());
        }
        Ok(fresh)
    }

    /// Backs off before the next attempt. Shutdown cuts the wait short and
    /// leaves the batch unacknowledged.
    async fn pause(&mut self, attempts: u32, what: &str, err: &(dyn fmt::Display + Sync)) -> Result<(), LaneExit> {
        let delay = self.backoff.delay(attempts);
        let partition = self.partition();
        warn!(relay = %self.relay, partition, attempts, "{} failed, retrying in {:?}: {}", what, delay, err);
        let msg = format!("{what}: {err}");
        self.status
            .update_lane(&self.relay, partition, |l| l.last_error = Some(msg))
            .await;
        if *self.shutdown.borrow() {
            return Err(LaneExit::Shutdown);
        }
        tokio::select! {
            _ = sleep(delay) => Ok(()),
            _ = self.shutdown.changed() => Err(LaneExit::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::memory::MemoryCheckpointStore,
        error::SinkError,
        codec::Codec,
        event::Operation,
        sink::{memory::MemorySink, ColumnType, DeleteMode, UnknownColumns},
        transport::{memory::MemoryTransport, Transport},
    };
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn users() -> SourceId {
        SourceId::new("inventory", "public", "users")
    }

    fn upsert(key: i64, seq: u64, name: &str) -> ChangeEvent {
        ChangeEvent::upsert(
            users(),
            Key::from(key),
            Operation::Create,
            json!({"id": key, "name": name}).as_object().cloned().unwrap(),
            Sequence(seq),
            Utc::now(),
        )
    }

    fn deliveries(events: Vec<ChangeEvent>) -> Vec<Delivery> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Delivery {
                partition: 0,
                offset: i as Offset,
                event,
            })
            .collect()
    }

    struct Fixture {
        sink: Arc<MemorySink>,
        checkpoints: Arc<MemoryCheckpointStore>,
        _shutdown: watch::Sender<bool>,
        lane: Lane,
    }

    async fn fixture(schema: TableSchema) -> Fixture {
        let transport = Arc::new(MemoryTransport::new(1, Codec::Json));
        let sink = Arc::new(MemorySink::new(DeleteMode::Hard));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (tx, rx) = watch::channel(false);
        let lane = Lane::new(
            "users",
            transport.subscribe(0).await.unwrap(),
            sink.clone(),
            checkpoints.clone(),
            Arc::new(schema),
            StatusBoard::new(),
            rx,
        )
        .with_backoff(Backoff::unbounded().with_initial(Duration::from_millis(1)));
        Fixture {
            sink,
            checkpoints,
            _shutdown: tx,
            lane,
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_lane_runs_on_the_multi_threaded_runtime() {
        let f = fixture(TableSchema::default()).await;
        let run = f.lane.run();
        assert_send(&run);
        tokio::spawn(run).abort();
    }

    #[tokio::test]
    async fn test_redelivered_and_stale_events_are_skipped() {
        let mut f = fixture(TableSchema::default()).await;
        let first = f
            .lane
            .apply(&deliveries(vec![upsert(1, 5, "a"), upsert(2, 6, "b")]))
            .await
            .unwrap();
        assert_eq!(first.applied, 2);

        // same events again plus an older version of key 1 and a newer one of key 2
        let again = f
            .lane
            .apply(&deliveries(vec![
                upsert(1, 5, "a"),
                upsert(1, 3, "older"),
                upsert(2, 7, "b2"),
                upsert(2, 7, "b2"),
            ]))
            .await
            .unwrap();
        assert_eq!(again.applied, 1);
        assert_eq!(again.duplicates, 3);
        let visible = f.sink.visible(&users());
        assert_eq!(visible[&Key::from(1)]["name"], "a");
        assert_eq!(visible[&Key::from(2)]["name"], "b2");
        assert_eq!(f.checkpoints.load(&users()).await.unwrap(), Some(Sequence(7)));
        assert_eq!(f.sink.writes(), 2);
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried_before_commit() {
        let mut f = fixture(TableSchema::default()).await;
        f.sink.fail_next_writes(3);
        let outcome = f
            .lane
            .apply(&deliveries(vec![upsert(1, 1, "a")]))
            .await
            .unwrap();
        assert_eq!(outcome.cursor, 1);
        assert_eq!(f.sink.visible(&users()).len(), 1);
        assert_eq!(f.lane.consumer.committed().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_schema_conflict_halts_without_checkpoint() {
        let schema = TableSchema {
            columns: BTreeMap::from([
                ("id".to_owned(), ColumnType::Int),
                ("name".to_owned(), ColumnType::Int),
            ]),
            unknown_columns: UnknownColumns::Accept,
        };
        let mut f = fixture(schema).await;
        match f.lane.apply(&deliveries(vec![upsert(1, 1, "a")])).await {
            Err(LaneExit::Halted(RelayError::Sink(SinkError::SchemaConflict { column, .. }))) => {
                assert_eq!(column, "name")
            }
            other => panic!("expected schema conflict, got {:?}", other),
        }
        assert!(f.sink.visible(&users()).is_empty());
        assert_eq!(f.checkpoints.load(&users()).await.unwrap(), None);
        assert_eq!(f.lane.consumer.committed().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_leaves_checkpoint() {
        let f = fixture(TableSchema::default()).await;
        let Fixture {
            sink,
            checkpoints,
            _shutdown: tx,
            lane,
            ..
        } = f;
        let mut lane = lane.with_backoff(Backoff::unbounded().with_initial(Duration::from_secs(60)));
        sink.fail_next_writes(1);
        let stop = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });
        let res = lane.apply(&deliveries(vec![upsert(1, 1, "a")])).await;
        assert!(matches!(res, Err(LaneExit::Shutdown)));
        assert_eq!(checkpoints.load(&users()).await.unwrap(), None);
        drop(stop.await.unwrap());
    }
}
