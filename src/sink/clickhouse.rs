//! ClickHouse sink.
//!
//! Every write is an insert into a `ReplacingMergeTree(sequence)` table
//! ordered by `(source_table, key)`: an upsert is a new version of the row,
//! a DELETE is a version with `is_deleted = 1`. Readers query with `FINAL`
//! (or `argMax(.., sequence)`) and filter out deleted rows.
//!
//! The full after-image is kept as JSON in `after_image`. Declared columns
//! are materialized next to it as typed `Nullable` columns, null on deletes.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::DateTime;
use clickhouse_rs::{errors::Error as ClickHouseError, types::Value, Block, Pool};
use tracing::{debug, info};

use super::{ColumnType, DeleteMode, Sink, SinkRow};
use crate::{
    error::SinkError,
    event::{ChangeEvent, Key, Sequence, SourceId},
};

type Row = Vec<(String, Value)>;

/// Columns every table has; declared columns may not reuse these names
const META_COLUMNS: &[&str] = &[
    "source_table",
    "key",
    "after_image",
    "operation",
    "sequence",
    "commit_ts_ms",
    "is_deleted",
];

/// ClickHouse server codes that retrying will not fix
const PERMANENT_CODES: &[u32] = &[
    6,  // CANNOT_PARSE_TEXT
    16, // NO_SUCH_COLUMN_IN_TABLE
    27, // CANNOT_PARSE_INPUT_ASSERTION_FAILED
    53, // TYPE_MISMATCH
    60, // UNKNOWN_TABLE
    62, // SYNTAX_ERROR
    70, // CANNOT_CONVERT_TYPE
    81, // UNKNOWN_DATABASE
];

/// keys per `IN (...)` lookup
const LOOKUP_CHUNK: usize = 1000;

pub struct ClickHouseSink {
    pool: Pool,
    table: String,
    columns: BTreeMap<String, ColumnType>,
}

impl ClickHouseSink {
    pub fn new(url: &str, table: &str) -> Result<ClickHouseSink, SinkError> {
        if !valid_identifier(table) {
            return Err(SinkError::Permanent(format!("invalid table name {table:?}")));
        }
        Ok(ClickHouseSink {
            pool: Pool::new(url),
            table: table.to_owned(),
            columns: BTreeMap::new(),
        })
    }

    /// Materializes the declared columns as typed columns of the table.
    pub fn with_columns(
        mut self,
        columns: BTreeMap<String, ColumnType>,
    ) -> Result<ClickHouseSink, SinkError> {
        for name in columns.keys() {
            if !valid_column(name) {
                return Err(SinkError::Permanent(format!("invalid column name {name:?}")));
            }
            if META_COLUMNS.contains(&name.as_str()) {
                return Err(SinkError::Permanent(format!(
                    "column {name} clashes with a relay column"
                )));
            }
        }
        self.columns = columns;
        Ok(self)
    }

    /// Creates the target table if it does not exist yet and adds declared
    /// columns it is missing.
    pub async fn ensure_table(&self) -> Result<(), SinkError> {
        let mut ch = self.pool.get_handle().await.map_err(classify)?;
        ch.execute(create_table_sql(&self.table, &self.columns))
            .await
            .map_err(classify)?;
        for sql in add_columns_sql(&self.table, &self.columns) {
            ch.execute(sql).await.map_err(classify)?;
        }
        info!(table = %self.table, columns = self.columns.len(), "clickhouse table ready");
        Ok(())
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    fn name(&self) -> String {
        format!("clickhouse:{}", self.table)
    }

    fn delete_mode(&self) -> DeleteMode {
        DeleteMode::Tombstone
    }

    async fn applied_sequences(
        &self,
        source_id: &SourceId,
        keys: &[Key],
    ) -> Result<HashMap<Key, Sequence>, SinkError> {
        let mut out = HashMap::new();
        if keys.is_empty() {
            return Ok(out);
        }
        let mut ch = self.pool.get_handle().await.map_err(classify)?;
        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let sql = applied_sequences_sql(&self.table, source_id, chunk);
            let block = ch.query(sql).fetch_all().await.map_err(classify)?;
            for row in block.rows() {
                let key: String = row.get("key").map_err(classify)?;
                let seq: u64 = row.get("seq").map_err(classify)?;
                out.insert(Key::from_canonical(key), Sequence(seq));
            }
        }
        Ok(out)
    }

    async fn write(&self, events: &[ChangeEvent]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut block = Block::with_capacity(events.len());
        for ev in events {
            block.push(to_row(&SinkRow::from(ev), &self.columns)?).map_err(classify)?;
        }
        let mut ch = self.pool.get_handle().await.map_err(classify)?;
        ch.insert(self.table.as_str(), block)
            .await
            .map_err(classify)?;
        debug!(table = %self.table, rows = events.len(), "inserted batch");
        Ok(())
    }

    async fn live_keys(&self, source_id: &SourceId) -> Result<Vec<Key>, SinkError> {
        let mut ch = self.pool.get_handle().await.map_err(classify)?;
        let block = ch
            .query(live_keys_sql(&self.table, source_id))
            .fetch_all()
            .await
            .map_err(classify)?;
        let mut keys = Vec::new();
        for row in block.rows() {
            let key: String = row.get("key").map_err(classify)?;
            keys.push(Key::from_canonical(key));
        }
        Ok(keys)
    }
}

fn to_row(row: &SinkRow, columns: &BTreeMap<String, ColumnType>) -> Result<Row, SinkError> {
    let after = match &row.after_image {
        Some(img) => serde_json::to_string(img).map_err(|e| SinkError::Permanent(e.to_string()))?,
        None => String::new(),
    };
    let mut out = vec![
        (String::from("source_table"), Value::from(row.source_table.clone())),
        (String::from("key"), Value::from(row.key.as_str().to_owned())),
        (String::from("after_image"), Value::from(after)),
        (String::from("operation"), Value::from(row.operation.as_str().to_owned())),
        (String::from("sequence"), Value::from(row.sequence.0)),
        (
            String::from("commit_ts_ms"),
            Value::from(row.commit_timestamp.timestamp_millis()),
        ),
        (String::from("is_deleted"), Value::from(u8::from(row.is_deleted))),
    ];
    for (name, ty) in columns {
        let v = row
            .after_image
            .as_ref()
            .and_then(|img| img.get(name))
            .filter(|v| !v.is_null());
        out.push((name.clone(), column_value(name, *ty, v)?));
    }
    Ok(out)
}

fn column_type_sql(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::String | ColumnType::Json => "Nullable(String)",
        ColumnType::Int | ColumnType::Timestamp => "Nullable(Int64)",
        ColumnType::Float => "Nullable(Float64)",
        ColumnType::Bool => "Nullable(UInt8)",
    }
}

/// Typed value of a declared column. Timestamps are stored as epoch
/// milliseconds.
fn column_value(name: &str, ty: ColumnType, v: Option<&serde_json::Value>) -> Result<Value, SinkError> {
    use serde_json::Value as Json;

    let mismatch = |v: &Json| SinkError::Permanent(format!("column {name}: cannot store {v} as {ty:?}"));
    Ok(match (ty, v) {
        (ColumnType::String, None) | (ColumnType::Json, None) => Value::from(None::<String>),
        (ColumnType::Int, None) | (ColumnType::Timestamp, None) => Value::from(None::<i64>),
        (ColumnType::Float, None) => Value::from(None::<f64>),
        (ColumnType::Bool, None) => Value::from(None::<u8>),
        (ColumnType::String, Some(Json::String(s))) => Value::from(Some(s.clone())),
        (ColumnType::Json, Some(v)) => Value::from(Some(v.to_string())),
        (ColumnType::Int, Some(v)) => Value::from(Some(v.as_i64().ok_or_else(|| mismatch(v))?)),
        (ColumnType::Float, Some(v)) => Value::from(Some(v.as_f64().ok_or_else(|| mismatch(v))?)),
        (ColumnType::Bool, Some(Json::Bool(b))) => Value::from(Some(u8::from(*b))),
        (ColumnType::Timestamp, Some(Json::String(s))) => {
            let ts = DateTime::parse_from_rfc3339(s).map_err(|e| {
                SinkError::Permanent(format!("column {name}: {s:?} is not a timestamp: {e}"))
            })?;
            Value::from(Some(ts.timestamp_millis()))
        }
        (ColumnType::Timestamp, Some(v)) => Value::from(Some(v.as_i64().ok_or_else(|| mismatch(v))?)),
        (_, Some(v)) => return Err(mismatch(v)),
    })
}

fn classify(e: ClickHouseError) -> SinkError {
    match &e {
        ClickHouseError::Server(server) if PERMANENT_CODES.contains(&server.code) => {
            SinkError::Permanent(e.to_string())
        }
        ClickHouseError::Server(_)
        | ClickHouseError::Io(_)
        | ClickHouseError::Connection(_)
        | ClickHouseError::Driver(_) => SinkError::Transient(e.to_string()),
        _ => SinkError::Permanent(e.to_string()),
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn valid_column(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Single-quoted ClickHouse string literal
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn create_table_sql(table: &str, columns: &BTreeMap<String, ColumnType>) -> String {
    let declared: String = columns
        .iter()
        .map(|(name, ty)| format!(",\n    {name} {}", column_type_sql(*ty)))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    source_table LowCardinality(String),
    key String,
    after_image String,
    operation LowCardinality(String),
    sequence UInt64,
    commit_ts_ms Int64,
    is_deleted UInt8{declared}
) ENGINE = ReplacingMergeTree(sequence)
ORDER BY (source_table, key)"
    )
}

fn add_columns_sql(table: &str, columns: &BTreeMap<String, ColumnType>) -> Vec<String> {
    columns
        .iter()
        .map(|(name, ty)| {
            format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {name} {}",
                column_type_sql(*ty)
            )
        })
        .collect()
}

fn applied_sequences_sql(table: &str, source_id: &SourceId, keys: &[Key]) -> String {
    let keys: Vec<String> = keys.iter().map(|k| quote(k.as_str())).collect();
    format!(
        "SELECT key, max(sequence) AS seq FROM {table} WHERE source_table = {} AND key IN ({}) GROUP BY key",
        quote(&source_id.to_string()),
        keys.join(", ")
    )
}

fn live_keys_sql(table: &str, source_id: &SourceId) -> String {
    format!(
        "SELECT key FROM {table} FINAL WHERE source_table = {} AND is_deleted = 0",
        quote(&source_id.to_string())
    )
}
