//! Relay pipeline and its supervisor.
//!
//! A relay moves one source table into one sink table: a single reader task
//! (log reader → normalizer → ordered publisher) feeding one materializer
//! lane per transport partition. The [Supervisor] is the operational
//! surface: register, start, status, resnapshot and shutdown.
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

use crate::{
    checkpoint::{file::FileCheckpointStore, CheckpointStore, FencedStore, SnapshotFence},
    codec::Codec,
    error::{CheckpointError, MalformedEntry, PublishRejected, RelayError, SinkError, SourceError},
    event::{ChangeEvent, Sequence, SourceId},
    materializer::Lane,
    normalizer::Normalizer,
    publisher::OrderedPublisher,
    retry::Backoff,
    settings::{self, SinkKind, TransportKind},
    sink::{clickhouse::ClickHouseSink, memory::MemorySink, Sink, TableSchema},
    source::{file::FileLog, ChangeLog, LogReader, ReaderRegistry},
    status::{LaneState, RelayState, RelayStatus, StatusBoard},
    transport::{kafka::KafkaTransport, memory::MemoryTransport, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// snapshot the source when it has no checkpoint
    #[default]
    Initial,
    /// always stream from the log
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    #[default]
    Halt,
    /// log and move past the entry
    Skip,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub primary_key: Vec<String>,
    pub snapshot_mode: SnapshotMode,
    pub malformed_policy: MalformedPolicy,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// publish attempts before the reader pauses on `PublishRejected`
    pub publish_attempts: u32,
    /// reader reconnects, lane retries and reader pauses
    pub retry: Backoff,
    /// how long the reader waits for new entries before polling again
    pub poll_interval: Duration,
    pub schema: TableSchema,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            primary_key: vec![String::from("id")],
            snapshot_mode: SnapshotMode::Initial,
            malformed_policy: MalformedPolicy::Halt,
            batch_size: 1000,
            batch_timeout: Duration::from_secs(10),
            publish_attempts: 5,
            retry: Backoff::unbounded(),
            poll_interval: Duration::from_millis(500),
            schema: TableSchema::default(),
        }
    }
}

pub struct Relay {
    name: String,
    source_id: SourceId,
    options: RelayOptions,
    log: Arc<dyn ChangeLog>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
}

impl Relay {
    pub fn new(
        name: &str,
        source_id: SourceId,
        log: Arc<dyn ChangeLog>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
    ) -> Relay {
        Relay {
            name: name.to_owned(),
            source_id,
            options: RelayOptions::default(),
            log,
            transport,
            sink,
        }
    }

    pub fn with_options(mut self, options: RelayOptions) -> Relay {
        self.options = options;
        self
    }

    /// Builds the relay's backends from its configuration.
    pub async fn from_settings(name: &str, cfg: &settings::Relay) -> anyhow::Result<Relay> {
        let source_id = cfg.source_id();
        let primary_key = cfg.primary_key();
        let log = Arc::new(FileLog::new(&cfg.log_path, primary_key.clone()));

        let codec = match cfg.codec() {
            "avro" => Codec::avro(cfg.avro_schema_id())?,
            other => Codec::from_name(other)?,
        };
        let partitions = cfg.partitions();
        let transport: Arc<dyn Transport> = match cfg.transport() {
            TransportKind::Kafka => {
                let broker = cfg
                    .kafka_broker
                    .as_deref()
                    .ok_or_else(|| anyhow!("kafka_broker is not set"))?;
                let topic = cfg.topic();
                let kafka = KafkaTransport::new(broker, &topic, cfg.consumer_group(name), partitions, codec)
                    .context("creating kafka transport")?;
                kafka
                    .verify_partitions()
                    .await
                    .with_context(|| format!("checking partitions of topic {topic}"))?;
                Arc::new(kafka)
            }
            TransportKind::Memory => Arc::new(MemoryTransport::new(partitions, codec)),
        };

        let sink: Arc<dyn Sink> = match cfg.sink() {
            SinkKind::Clickhouse => {
                let url = cfg
                    .clickhouse_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("clickhouse_url is not set"))?;
                let table = cfg
                    .clickhouse_table
                    .as_deref()
                    .ok_or_else(|| anyhow!("clickhouse_table is not set"))?;
                let sink = ClickHouseSink::new(url, table)?.with_columns(cfg.columns())?;
                sink.ensure_table()
                    .await
                    .with_context(|| format!("preparing clickhouse table {table}"))?;
                Arc::new(sink)
            }
            SinkKind::Memory => Arc::new(MemorySink::new(cfg.delete_mode())),
        };

        let options = RelayOptions {
            primary_key,
            snapshot_mode: cfg.snapshot_mode(),
            malformed_policy: cfg.malformed_policy(),
            batch_size: cfg.batch_size(),
            batch_timeout: cfg.batch_timeout(),
            publish_attempts: cfg.publish_max_attempts(),
            schema: TableSchema {
                columns: cfg.columns(),
                unknown_columns: cfg.unknown_columns(),
            },
            ..RelayOptions::default()
        };
        info!(
            relay = name,
            source = %source_id,
            transport = %transport.name(),
            sink = %sink.name(),
            "relay configured"
        );
        Ok(Relay::new(name, source_id, log, transport, sink).with_options(options))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }
}

/// Waits until every lane has committed past the transport's current end.
/// Fails if a lane is halted, since it will never get there.
async fn drain(relay: &Relay, status: &StatusBoard) -> Result<(), RelayError> {
    for partition in 0..relay.transport.partitions() {
        let target = relay.transport.high_watermark(partition).await?;
        loop {
            if target == 0 {
                break;
            }
            let lane = status
                .get(&relay.name)
                .await
                .and_then(|s| s.lanes.get(&partition).cloned());
            if let Some(lane) = lane {
                if lane.state == LaneState::Halted {
                    return Err(RelayError::Other(format!(
                        "lane {partition} of {} is halted, it cannot be drained",
                        relay.name
                    )));
                }
                if lane.cursor.is_some_and(|c| c >= target) {
                    break;
                }
            }
            sleep(relay.options.poll_interval.min(Duration::from_millis(100))).await;
        }
    }
    Ok(())
}

/// Why the reader task stopped
enum Stop {
    Shutdown,
    Halt(RelayError),
}

macro_rules! halts {
    ($($err:ty),*) => {$(
        impl From<$err> for Stop {
            fn from(e: $err) -> Stop {
                Stop::Halt(e.into())
            }
        }
    )*};
}

halts!(RelayError, SourceError, MalformedEntry, CheckpointError, SinkError, PublishRejected);

struct ReaderTask {
    relay: Arc<Relay>,
    /// snapshot when there is no checkpoint, whatever the snapshot mode
    force_snapshot: bool,
    registry: ReaderRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    fence: SnapshotFence,
    status: StatusBoard,
    shutdown: watch::Receiver<bool>,
}

impl ReaderTask {
    async fn run(mut self) {
        let relay = self.relay.clone();
        match self.drive().await {
            Ok(()) | Err(Stop::Shutdown) => {
                info!(relay = %relay.name, "reader stopped");
                self.status
                    .update(&relay.name, |s| {
                        if s.state != RelayState::Halted {
                            s.state = RelayState::Stopped;
                        }
                    })
                    .await;
            }
            Err(Stop::Halt(e)) => {
                error!(relay = %relay.name, source = %relay.source_id, "reader halted: {}", e);
                let msg = e.to_string();
                self.status
                    .update(&relay.name, |s| {
                        s.state = RelayState::Halted;
                        s.last_error = Some(msg);
                    })
                    .await;
            }
        }
    }

    async fn drive(&mut self) -> Result<(), Stop> {
        let relay = self.relay.clone();
        let source_id = &relay.source_id;
        let reader = LogReader::new(relay.log.clone(), self.registry.clone())
            .with_poll_interval(relay.options.poll_interval);
        let normalizer = Normalizer::new(source_id.clone(), relay.options.primary_key.clone());
        let publisher = OrderedPublisher::new(
            relay.transport.clone(),
            Backoff::bounded(relay.options.publish_attempts).with_initial(relay.options.retry.initial),
        );

        let mut attempts = 0;
        let mut position = loop {
            match self.checkpoints.load(source_id).await {
                Ok(p) => break p,
                Err(CheckpointError::Io(e)) => {
                    attempts += 1;
                    self.pause(attempts, "checkpoint load", &e).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };
        if position.is_none()
            && (self.force_snapshot || relay.options.snapshot_mode == SnapshotMode::Initial)
        {
            position = self.snapshot(&reader, &normalizer, &publisher).await?;
        } else {
            self.fence.lower(source_id);
        }

        let mut attempts = 0;
        loop {
            let mut stream = match reader.open(source_id, position).await {
                Ok(stream) => stream,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "open", &e).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.status
                .update(&relay.name, |s| {
                    s.state = RelayState::Running;
                    s.reader_position = position;
                    s.last_error = None;
                })
                .await;

            let failure = loop {
                if *self.shutdown.borrow() {
                    return Err(Stop::Shutdown);
                }
                let raw = tokio::select! {
                    raw = stream.next() => raw,
                    _ = self.shutdown.changed() => return Err(Stop::Shutdown),
                };
                let raw = match raw {
                    Ok(raw) => raw,
                    Err(e) if e.is_transient() => break e,
                    Err(e) => return Err(e.into()),
                };
                attempts = 0;
                let sequence = raw.sequence;
                if let Some(p) = position.filter(|p| sequence <= *p) {
                    self.malformed(MalformedEntry::new(
                        sequence,
                        format!("sequence does not advance past {p}"),
                    ))?;
                    continue;
                }
                match normalizer.normalize(raw) {
                    Ok(event) => self.publish(&publisher, &event).await?,
                    Err(e) => self.malformed(e)?,
                }
                position = Some(sequence);
                self.status
                    .update(&relay.name, |s| s.reader_position = position)
                    .await;
            };
            drop(stream);
            attempts += 1;
            self.pause(attempts, "read", &failure).await?;
        }
    }

    /// Publishes the current rows as CREATE at the snapshot sequence, then a
    /// DELETE for every row the sink still holds that the source no longer has.
    /// Returns the position streaming continues from.
    async fn snapshot(
        &mut self,
        reader: &LogReader,
        normalizer: &Normalizer,
        publisher: &OrderedPublisher,
    ) -> Result<Option<Sequence>, Stop> {
        let relay = self.relay.clone();
        let source_id = &relay.source_id;
        self.status
            .update(&relay.name, |s| s.state = RelayState::Snapshotting)
            .await;
        // lifted only once every snapshot event is applied and checkpointed
        self.fence.raise(source_id);

        // lanes must be done with older events before the sink is compared
        tokio::select! {
            drained = drain(&relay, &self.status) => drained?,
            _ = self.shutdown.changed() => return Err(Stop::Shutdown),
        }

        let mut attempts = 0;
        let snapshot = loop {
            match reader.snapshot(source_id).await {
                Ok(snapshot) => break snapshot,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "snapshot", &e).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let Some(snapshot) = snapshot else {
            warn!(relay = %relay.name, source = %source_id, "log cannot snapshot, streaming from its start");
            self.fence.lower(source_id);
            return Ok(None);
        };
        info!(
            relay = %relay.name,
            source = %source_id,
            rows = snapshot.rows.len(),
            as_of = %snapshot.as_of,
            "snapshotting"
        );

        let mut present = HashSet::new();
        for raw in snapshot.rows {
            match normalizer.normalize(raw) {
                Ok(event) => {
                    present.insert(event.key.clone());
                    self.publish(publisher, &event).await?;
                }
                Err(e) => self.malformed(e)?,
            }
        }

        let mut attempts = 0;
        let live = loop {
            match relay.sink.live_keys(source_id).await {
                Ok(keys) => break keys,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "sink live keys", &e).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let mut removed = 0;
        for key in live.into_iter().filter(|k| !present.contains(k)) {
            let event = ChangeEvent::tombstone(source_id.clone(), key, snapshot.as_of, Utc::now());
            self.publish(publisher, &event).await?;
            removed += 1;
        }
        info!(
            relay = %relay.name,
            source = %source_id,
            rows = present.len(),
            removed,
            "snapshot published"
        );

        tokio::select! {
            drained = drain(&relay, &self.status) => drained?,
            _ = self.shutdown.changed() => return Err(Stop::Shutdown),
        }
        let mut attempts = 0;
        loop {
            match self.checkpoints.save(source_id, snapshot.as_of).await {
                Ok(()) => break,
                Err(CheckpointError::Io(e)) => {
                    attempts += 1;
                    self.pause(attempts, "checkpoint save", &e).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.fence.lower(source_id);
        info!(relay = %relay.name, source = %source_id, as_of = %snapshot.as_of, "snapshot applied");
        Ok(Some(snapshot.as_of))
    }

    /// Publishes, pausing for as long as the transport rejects the event.
    /// The reader does not move past the event until it is published.
    async fn publish(&mut self, publisher: &OrderedPublisher, event: &ChangeEvent) -> Result<(), Stop> {
        let mut attempts = 0;
        loop {
            match publisher.publish(event).await {
                Ok(_) => return Ok(()),
                Err(rejected) if rejected.cause.is_transient() => {
                    attempts += 1;
                    self.pause(attempts, "publish", &rejected).await?;
                }
                Err(rejected) => return Err(rejected.into()),
            }
        }
    }

    fn malformed(&self, e: MalformedEntry) -> Result<(), Stop> {
        match self.relay.options.malformed_policy {
            MalformedPolicy::Halt => Err(e.into()),
            MalformedPolicy::Skip => {
                error!(relay = %self.relay.name, source = %self.relay.source_id, "skipping {}", e);
                Ok(())
            }
        }
    }

    async fn pause(
        &mut self,
        attempts: u32,
        what: &str,
        err: &(dyn fmt::Display + Sync),
    ) -> Result<(), Stop> {
        let delay = self.relay.options.retry.delay(attempts);
        warn!(relay = %self.relay.name, attempts, "{} failed, retrying in {:?}: {}", what, delay, err);
        let msg = format!("{what}: {err}");
        self.status
            .update(&self.relay.name, |s| s.last_error = Some(msg))
            .await;
        if *self.shutdown.borrow() {
            return Err(Stop::Shutdown);
        }
        tokio::select! {
            _ = sleep(delay) => Ok(()),
            _ = self.shutdown.changed() => Err(Stop::Shutdown),
        }
    }
}

/// A group of spawned tasks sharing one shutdown signal
struct Tasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn new() -> Tasks {
        let (shutdown, _) = watch::channel(false);
        Tasks {
            shutdown,
            handles: Vec::new(),
        }
    }

    fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("relay task failed: {}", e);
            }
        }
    }
}

struct Managed {
    relay: Arc<Relay>,
    reader: Option<Tasks>,
    lanes: Option<Tasks>,
}

pub struct Supervisor {
    registry: ReaderRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    fence: SnapshotFence,
    status: StatusBoard,
    relays: BTreeMap<String, Managed>,
}

impl Supervisor {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, status: StatusBoard) -> Supervisor {
        Supervisor {
            registry: ReaderRegistry::new(),
            checkpoints,
            fence: SnapshotFence::new(),
            status,
            relays: BTreeMap::new(),
        }
    }

    /// Guards sources with lock files under `dir`, so two relay processes
    /// sharing a state directory never read the same source.
    pub fn with_lock_dir(mut self, dir: impl AsRef<Path>) -> std::io::Result<Supervisor> {
        self.registry = ReaderRegistry::with_lock_dir(dir)?;
        Ok(self)
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.status
    }

    /// Registers a relay. Two relays for the same source are rejected.
    pub async fn register(&mut self, relay: Relay) -> Result<(), RelayError> {
        if self.relays.contains_key(relay.name()) {
            return Err(RelayError::Other(format!(
                "relay {} is already registered",
                relay.name()
            )));
        }
        if self.relays.values().any(|m| m.relay.source_id == relay.source_id) {
            return Err(SourceError::DuplicateReader(relay.source_id.clone()).into());
        }
        self.status.register(relay.name(), relay.source_id.clone()).await;
        info!(relay = relay.name(), source = %relay.source_id, "relay registered");
        self.relays.insert(
            relay.name.clone(),
            Managed {
                relay: Arc::new(relay),
                reader: None,
                lanes: None,
            },
        );
        Ok(())
    }

    pub fn relays(&self) -> impl Iterator<Item = &str> {
        self.relays.keys().map(String::as_str)
    }

    /// Starts the relay's lanes and reader. A stopped or halted reader is
    /// restarted; running tasks are left alone.
    pub async fn start(&mut self, name: &str) -> Result<(), RelayError> {
        self.spawn(name, false).await
    }

    async fn spawn(&mut self, name: &str, force_snapshot: bool) -> Result<(), RelayError> {
        let managed = self
            .relays
            .get_mut(name)
            .ok_or_else(|| RelayError::UnknownRelay(name.to_owned()))?;
        let relay = managed.relay.clone();

        if managed.lanes.as_ref().map_or(true, Tasks::is_finished) {
            if let Some(old) = managed.lanes.take() {
                old.stop().await;
            }
            let mut lanes = Tasks::new();
            for partition in 0..relay.transport.partitions() {
                let consumer = relay.transport.subscribe(partition).await?;
                let lane = Lane::new(
                    &relay.name,
                    consumer,
                    relay.sink.clone(),
                    Arc::new(FencedStore::new(self.checkpoints.clone(), self.fence.clone())),
                    Arc::new(relay.options.schema.clone()),
                    self.status.clone(),
                    lanes.shutdown.subscribe(),
                )
                .with_batching(relay.options.batch_size, relay.options.batch_timeout)
                .with_backoff(relay.options.retry.clone());
                lanes.handles.push(tokio::spawn(async move {
                    lane.run().await;
                }));
            }
            managed.lanes = Some(lanes);
        }

        if managed.reader.as_ref().map_or(true, Tasks::is_finished) {
            if let Some(old) = managed.reader.take() {
                old.stop().await;
            }
            let mut reader = Tasks::new();
            let task = ReaderTask {
                relay: relay.clone(),
                force_snapshot,
                registry: self.registry.clone(),
                checkpoints: self.checkpoints.clone(),
                fence: self.fence.clone(),
                status: self.status.clone(),
                shutdown: reader.shutdown.subscribe(),
            };
            self.status
                .update(&relay.name, |s| s.state = RelayState::Starting)
                .await;
            reader.handles.push(tokio::spawn(task.run()));
            managed.reader = Some(reader);
        }
        info!(relay = name, "relay started");
        Ok(())
    }

    pub async fn start_all(&mut self) -> Result<(), RelayError> {
        let names: Vec<String> = self.relays.keys().cloned().collect();
        for name in names {
            self.start(&name).await?;
        }
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<RelayStatus, RelayError> {
        self.status
            .get(name)
            .await
            .ok_or_else(|| RelayError::UnknownRelay(name.to_owned()))
    }

    /// Rebuilds the sink table of a relay from a fresh snapshot of its
    /// source: stops the reader, lets the lanes finish what is already in the
    /// transport, forgets the checkpoint and starts the reader again, which
    /// then snapshots. A relay that is not running only has its checkpoint
    /// reset.
    pub async fn resnapshot(&mut self, name: &str) -> Result<(), RelayError> {
        let managed = self
            .relays
            .get_mut(name)
            .ok_or_else(|| RelayError::UnknownRelay(name.to_owned()))?;
        let relay = managed.relay.clone();
        if let Some(reader) = managed.reader.take() {
            reader.stop().await;
        }
        self.fence.raise(&relay.source_id);
        if managed.lanes.is_some() {
            drain(&relay, &self.status).await?;
        }
        self.checkpoints.reset(&relay.source_id).await?;
        self.status
            .update(name, |s| {
                s.state = RelayState::Starting;
                s.reader_position = None;
                s.last_error = None;
            })
            .await;
        info!(relay = name, source = %relay.source_id, "checkpoint reset for resnapshot");
        let running = self.relays.get(name).is_some_and(|m| m.lanes.is_some());
        if running {
            self.spawn(name, true).await?;
        }
        Ok(())
    }

    /// Stops readers first, then lanes. In-flight sink writes complete;
    /// nothing is acknowledged past what was written.
    pub async fn shutdown(&mut self) {
        for (name, managed) in &mut self.relays {
            if let Some(reader) = managed.reader.take() {
                reader.stop().await;
            }
            if let Some(lanes) = managed.lanes.take() {
                lanes.stop().await;
            }
            info!(relay = %name, "relay shut down");
        }
        if let Err(e) = self.status.flush().await {
            warn!("flushing status: {:#}", e);
        }
    }
}

/// Loads every configured relay into a supervisor backed by file checkpoints
/// and a status file under the state directory.
pub async fn supervisor_from_settings(settings: &settings::Settings) -> anyhow::Result<Supervisor> {
    let state_dir = Path::new(settings.state_dir());
    let checkpoints = FileCheckpointStore::new(state_dir.join("checkpoints"))
        .await
        .with_context(|| format!("opening checkpoints in {}", state_dir.display()))?;
    let status = StatusBoard::persisted(state_dir.join("status.json"));
    let locks = state_dir.join("locks");
    let mut supervisor = Supervisor::new(Arc::new(checkpoints), status)
        .with_lock_dir(&locks)
        .with_context(|| format!("creating {}", locks.display()))?;
    let mut names: Vec<&String> = settings.relays.keys().collect();
    names.sort();
    for name in names {
        let relay = Relay::from_settings(name, &settings.relays[name])
            .await
            .with_context(|| format!("failed to create relay {name}"))?;
        supervisor.register(relay).await?;
    }
    Ok(supervisor)
}
