//! ## walrelay
//! Change-data-capture relay: tails the ordered change log of a source table,
//! publishes every row mutation onto a partitioned transport (Kafka) and
//! materializes it into an analytical table (ClickHouse).
//!
//! ## Installation
//! Just use cargo.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! state_dir = "./state"                   # checkpoints, reader locks and status.json
//! log_format = "json"
//!
//! [relays.users]
//! database = "inventory"
//! table = "users"                         # schema defaults to "public"
//! primary_key = ["id"]
//! log_path = "./inventory.users.jsonl"    # JSON-lines change log to tail
//! kafka_broker = "localhost:9092"         # topic defaults to cdc.inventory.public.users
//! partitions = 4
//! batch_size = 1000
//! batch_timeout_seconds = 10
//! clickhouse_url = "tcp://localhost:9000"
//! clickhouse_table = "cdc_users"
//! columns = { id = "int", name = "string" }
//! unknown_columns = "accept"
//! ```
//!
//! ## Pipeline
//! Per relay, one reader task reads the change log strictly in order,
//! [normalizes](normalizer) each entry into a [ChangeEvent] and hands it to
//! the [publisher], which routes it to a partition by hashing its key. The
//! reader only moves past an entry once it is published, so a transport
//! outage pauses the relay instead of opening a gap.
//!
//! Every partition has its own [materializer] lane. A lane applies batches in
//! delivery order, skips events whose sequence the sink already holds for that
//! key, and only then saves the [checkpoint] and commits its transport
//! cursor. Delivery is at-least-once, application is effectively exactly-once.
//!
//! ## Failures
//! Transient errors (source unavailable, transport full, sink timeouts) are
//! retried with backoff. Fatal ones halt the affected reader or lane and show
//! up in the [status] surface: a purged resume position needs a
//! [resnapshot](relay::Supervisor::resnapshot), a schema conflict halts only
//! the lane that hit it.
//!
//! [ChangeEvent]: event::ChangeEvent

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod event;
pub mod materializer;
pub mod normalizer;
pub mod publisher;
pub mod relay;
pub mod retry;
pub mod settings;
pub mod sink;
pub mod source;
pub mod status;
pub mod transport;
