//! Application config
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::{
    error::SourceError,
    event::SourceId,
    relay::{MalformedPolicy, SnapshotMode},
    sink::{ColumnType, DeleteMode, UnknownColumns},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Kafka,
    /// in-process, not durable across restarts
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Clickhouse,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// configuration of single relay: one source table into one sink table
#[derive(Debug, Deserialize)]
pub struct Relay {
    /// source database name
    pub database: String,
    /// source schema (default: public)
    pub schema: Option<String>,
    /// source table
    pub table: String,
    /// primary key columns (default: ["id"])
    pub primary_key: Option<Vec<String>>,
    /// JSON-lines change log of the source
    pub log_path: String,
    /// initial or never (default: initial)
    pub snapshot_mode: Option<SnapshotMode>,
    /// halt or skip (default: halt)
    pub malformed_policy: Option<MalformedPolicy>,
    /// kafka or memory (default: kafka)
    pub transport: Option<TransportKind>,
    /// address of bootstrap kafka broker
    pub kafka_broker: Option<String>,
    /// transport topic (default: cdc.<database>.<schema>.<table>)
    pub topic: Option<String>,
    /// consumer group of the lanes (default: relay's name)
    pub consumer_group: Option<String>,
    /// number of partitions, one lane each (default: 4)
    pub partitions: Option<u32>,
    /// json or avro (default: json)
    pub codec: Option<String>,
    /// schema id written into the avro header (default: 1)
    pub avro_schema_id: Option<u32>,
    /// max sink write batch size (default: 1000)
    pub batch_size: Option<usize>,
    /// batching timeout (default: 10s)
    pub batch_timeout_seconds: Option<u64>,
    /// publish attempts before the reader pauses (default: 5)
    pub publish_max_attempts: Option<u32>,
    /// clickhouse or memory (default: clickhouse)
    pub sink: Option<SinkKind>,
    /// URL of ClickHouse
    pub clickhouse_url: Option<String>,
    /// ClickHouse table to materialize into
    pub clickhouse_table: Option<String>,
    /// hard or tombstone (default: tombstone)
    pub delete_mode: Option<DeleteMode>,
    /// accept or reject (default: accept)
    pub unknown_columns: Option<UnknownColumns>,
    /// declared sink columns, empty means no declared schema
    pub columns: Option<BTreeMap<String, ColumnType>>,
}

/// Effective values of a relay's settings. Every default lives here.
impl Relay {
    pub fn source_id(&self) -> SourceId {
        SourceId::new(&self.database, self.schema(), &self.table)
    }

    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }

    pub fn primary_key(&self) -> Vec<String> {
        match &self.primary_key {
            Some(pk) if !pk.is_empty() => pk.clone(),
            _ => vec![String::from("id")],
        }
    }

    pub fn snapshot_mode(&self) -> SnapshotMode {
        self.snapshot_mode.unwrap_or(SnapshotMode::Initial)
    }

    pub fn malformed_policy(&self) -> MalformedPolicy {
        self.malformed_policy.unwrap_or(MalformedPolicy::Halt)
    }

    pub fn transport(&self) -> TransportKind {
        self.transport.unwrap_or(TransportKind::Kafka)
    }

    pub fn topic(&self) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| format!("cdc.{}", self.source_id()))
    }

    pub fn consumer_group<'a>(&'a self, name: &'a str) -> &'a str {
        self.consumer_group.as_deref().unwrap_or(name)
    }

    pub fn partitions(&self) -> u32 {
        self.partitions.unwrap_or(4)
    }

    pub fn codec(&self) -> &str {
        self.codec.as_deref().unwrap_or("json")
    }

    pub fn avro_schema_id(&self) -> u32 {
        self.avro_schema_id.unwrap_or(1)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1000)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds.unwrap_or(10))
    }

    pub fn publish_max_attempts(&self) -> u32 {
        self.publish_max_attempts.unwrap_or(5)
    }

    pub fn sink(&self) -> SinkKind {
        self.sink.unwrap_or(SinkKind::Clickhouse)
    }

    pub fn delete_mode(&self) -> DeleteMode {
        self.delete_mode.unwrap_or(DeleteMode::Tombstone)
    }

    pub fn unknown_columns(&self) -> UnknownColumns {
        self.unknown_columns.unwrap_or(UnknownColumns::Accept)
    }

    pub fn columns(&self) -> BTreeMap<String, ColumnType> {
        self.columns.clone().unwrap_or_default()
    }

    /// Writes the effective values back so the loaded settings show them.
    fn fill_defaults(&mut self, name: &str) {
        self.schema = Some(self.schema().to_owned());
        self.primary_key = Some(self.primary_key());
        self.snapshot_mode = Some(self.snapshot_mode());
        self.malformed_policy = Some(self.malformed_policy());
        self.transport = Some(self.transport());
        self.topic = Some(self.topic());
        self.consumer_group = Some(self.consumer_group(name).to_owned());
        self.partitions = Some(self.partitions());
        self.codec = Some(self.codec().to_owned());
        self.avro_schema_id = Some(self.avro_schema_id());
        self.batch_size = Some(self.batch_size());
        self.batch_timeout_seconds = Some(self.batch_timeout().as_secs());
        self.publish_max_attempts = Some(self.publish_max_attempts());
        self.sink = Some(self.sink());
        self.delete_mode = Some(self.delete_mode());
        self.unknown_columns = Some(self.unknown_columns());
        self.columns = Some(self.columns());
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.partitions() == 0 {
            return Err(format!("relay {name}: partitions must be at least 1"));
        }
        if self.batch_size() == 0 {
            return Err(format!("relay {name}: batch_size must be at least 1"));
        }
        if self.transport() == TransportKind::Kafka && self.kafka_broker.is_none() {
            return Err(format!("relay {name}: kafka_broker is required"));
        }
        if self.sink() == SinkKind::Clickhouse {
            if self.clickhouse_url.is_none() || self.clickhouse_table.is_none() {
                return Err(format!(
                    "relay {name}: clickhouse_url and clickhouse_table are required"
                ));
            }
            if self.delete_mode() == DeleteMode::Hard {
                return Err(format!(
                    "relay {name}: clickhouse sink is append-only, use delete_mode = \"tombstone\""
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// checkpoints and status file live here (default: ./state)
    pub state_dir: Option<String>,
    /// pretty or json (default: pretty)
    pub log_format: Option<LogFormat>,
    /// Map of relay names and settings
    pub relays: HashMap<String, Relay>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;
        settings.finish()?;
        Ok(settings)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        self.state_dir.get_or_insert_with(|| String::from("./state"));
        self.log_format.get_or_insert(LogFormat::Pretty);

        let mut sources: HashMap<SourceId, &str> = HashMap::new();
        for (name, cfg) in &mut self.relays {
            cfg.fill_defaults(name);
            cfg.validate(name).map_err(ConfigError::Message)?;
        }
        for (name, cfg) in &self.relays {
            if let Some(other) = sources.insert(cfg.source_id(), name) {
                return Err(ConfigError::Message(format!(
                    "relays {other} and {name}: {}",
                    SourceError::DuplicateReader(cfg.source_id())
                )));
            }
        }
        Ok(())
    }

    pub fn state_dir(&self) -> &str {
        self.state_dir.as_deref().unwrap_or("./state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(toml: &str) -> Result<Settings, ConfigError> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        Settings::new(file.path().to_str().unwrap())
    }

    #[test]
    fn test_defaults_are_filled() {
        let settings = load(
            r#"
            [relays.users]
            database = "inventory"
            table = "users"
            log_path = "./users.jsonl"
            kafka_broker = "localhost:9092"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "cdc_users"
            "#,
        )
        .unwrap();
        assert_eq!(settings.state_dir(), "./state");
        assert_eq!(settings.log_format, Some(LogFormat::Pretty));
        let users = &settings.relays["users"];
        assert_eq!(users.topic.as_deref(), Some("cdc.inventory.public.users"));
        assert_eq!(users.consumer_group.as_deref(), Some("users"));
        assert_eq!(users.primary_key, Some(vec![String::from("id")]));
        assert_eq!(users.partitions, Some(4));
        assert_eq!(users.batch_size, Some(1000));
        assert_eq!(users.delete_mode, Some(DeleteMode::Tombstone));
        assert_eq!(users.snapshot_mode, Some(SnapshotMode::Initial));
        assert_eq!(users.malformed_policy, Some(MalformedPolicy::Halt));
    }

    #[test]
    fn test_unfilled_relay_reports_the_filled_values() {
        let raw = r#"
            database = "inventory"
            table = "users"
            log_path = "./users.jsonl"
            "#;
        let unfilled: Relay = toml_relay(raw);
        let mut filled: Relay = toml_relay(raw);
        filled.fill_defaults("users");

        assert_eq!(filled.schema.as_deref(), Some(unfilled.schema()));
        assert_eq!(filled.primary_key, Some(unfilled.primary_key()));
        assert_eq!(filled.topic, Some(unfilled.topic()));
        assert_eq!(filled.consumer_group.as_deref(), Some(unfilled.consumer_group("users")));
        assert_eq!(filled.partitions, Some(unfilled.partitions()));
        assert_eq!(filled.codec.as_deref(), Some(unfilled.codec()));
        assert_eq!(filled.batch_size, Some(unfilled.batch_size()));
        assert_eq!(filled.batch_timeout(), unfilled.batch_timeout());
        assert_eq!(filled.publish_max_attempts, Some(unfilled.publish_max_attempts()));
        assert_eq!(filled.transport, Some(unfilled.transport()));
        assert_eq!(filled.sink, Some(unfilled.sink()));
        assert_eq!(filled.delete_mode, Some(unfilled.delete_mode()));
        assert_eq!(filled.unknown_columns, Some(unfilled.unknown_columns()));
        assert_eq!(unfilled.primary_key(), vec![String::from("id")]);
    }

    fn toml_relay(raw: &str) -> Relay {
        Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_declared_columns_and_policies() {
        let settings = load(
            r#"
            log_format = "json"
            [relays.orders]
            database = "shop"
            schema = "sales"
            table = "orders"
            primary_key = ["tenant", "id"]
            log_path = "./orders.jsonl"
            transport = "memory"
            sink = "memory"
            delete_mode = "hard"
            unknown_columns = "reject"
            malformed_policy = "skip"
            columns = { id = "int", total = "float", placed_at = "timestamp" }
            "#,
        )
        .unwrap();
        assert_eq!(settings.log_format, Some(LogFormat::Json));
        let orders = &settings.relays["orders"];
        assert_eq!(orders.source_id(), SourceId::new("shop", "sales", "orders"));
        assert_eq!(orders.unknown_columns, Some(UnknownColumns::Reject));
        let columns = orders.columns.as_ref().unwrap();
        assert_eq!(columns.get("total"), Some(&ColumnType::Float));
        assert_eq!(columns.len(), 3);
    }

    #[test]
    fn test_duplicate_source_is_rejected() {
        let err = load(
            r#"
            [relays.a]
            database = "inventory"
            table = "users"
            log_path = "./users.jsonl"
            transport = "memory"
            sink = "memory"
            [relays.b]
            database = "inventory"
            table = "users"
            log_path = "./users.jsonl"
            transport = "memory"
            sink = "memory"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("already has an active reader"));
    }

    #[test]
    fn test_hard_delete_on_clickhouse_is_rejected() {
        let err = load(
            r#"
            [relays.users]
            database = "inventory"
            table = "users"
            log_path = "./users.jsonl"
            transport = "memory"
            delete_mode = "hard"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "cdc_users"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("append-only"));
    }
}
