//! Analytical sink the materializer writes into
pub mod clickhouse;
pub mod memory;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::SinkError,
    event::{ChangeEvent, Key, Operation, RowImage, Sequence, SourceId},
};

/// How a DELETE reaches the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// remove the row in place
    Hard,
    /// append a delete-marker row; readers take the highest sequence per key
    Tombstone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Null is accepted by every column type.
    pub fn accepts(&self, v: &Value) -> bool {
        match (self, v) {
            (_, Value::Null) => true,
            (ColumnType::Json, _) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Bool, Value::Bool(_)) => true,
            (ColumnType::Timestamp, Value::Number(n)) => n.is_i64(),
            (ColumnType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Bool => "bool",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownColumns {
    #[default]
    Accept,
    Reject,
}

/// Declared columns of a sink table. No declared columns means anything goes.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub columns: BTreeMap<String, ColumnType>,
    pub unknown_columns: UnknownColumns,
}

impl TableSchema {
    /// Drift policy: extra columns pass unless rejected, type mismatches never do.
    pub fn check(&self, image: &RowImage) -> Result<(), SinkError> {
        if self.columns.is_empty() {
            return Ok(());
        }
        for (column, value) in image {
            match self.columns.get(column) {
                Some(ty) if !ty.accepts(value) => {
                    return Err(SinkError::SchemaConflict {
                        column: column.clone(),
                        expected: ty.name().to_owned(),
                        found: value_kind(value).to_owned(),
                    })
                }
                Some(_) => {}
                None if self.unknown_columns == UnknownColumns::Reject => {
                    return Err(SinkError::SchemaConflict {
                        column: column.clone(),
                        expected: "no such column".to_owned(),
                        found: value_kind(value).to_owned(),
                    })
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A row as stored: the after image plus the metadata columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    pub source_table: String,
    pub key: Key,
    pub after_image: Option<RowImage>,
    pub operation: Operation,
    pub sequence: Sequence,
    pub commit_timestamp: DateTime<Utc>,
    pub is_deleted: bool,
}

impl From<&ChangeEvent> for SinkRow {
    fn from(ev: &ChangeEvent) -> SinkRow {
        SinkRow {
            source_table: ev.source_id.to_string(),
            key: ev.key.clone(),
            after_image: ev.after_image.clone(),
            operation: ev.operation,
            sequence: ev.sequence,
            commit_timestamp: ev.commit_timestamp,
            is_deleted: ev.is_delete(),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> String;

    fn delete_mode(&self) -> DeleteMode;

    /// Highest applied sequence of each given key, deletes included.
    /// Keys never applied are absent from the map.
    async fn applied_sequences(
        &self,
        source_id: &SourceId,
        keys: &[Key],
    ) -> Result<HashMap<Key, Sequence>, SinkError>;

    /// Applies the events in order as one write: full replace-by-key for
    /// CREATE/UPDATE, removal or delete marker for DELETE.
    /// Durable once this returns.
    async fn write(&self, events: &[ChangeEvent]) -> Result<(), SinkError>;

    /// Keys whose latest state is a live (not deleted) row.
    async fn live_keys(&self, source_id: &SourceId) -> Result<Vec<Key>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(v: Value) -> RowImage {
        v.as_object().cloned().unwrap()
    }

    fn schema(unknown: UnknownColumns) -> TableSchema {
        TableSchema {
            columns: BTreeMap::from([
                ("id".to_owned(), ColumnType::Int),
                ("name".to_owned(), ColumnType::String),
                ("created_at".to_owned(), ColumnType::Timestamp),
            ]),
            unknown_columns: unknown,
        }
    }

    #[test]
    fn test_accepts_matching_and_null() {
        let s = schema(UnknownColumns::Accept);
        assert!(s
            .check(&image(json!({"id": 1, "name": null, "created_at": "2024-10-10T12:34:56Z"})))
            .is_ok());
    }

    #[test]
    fn test_unknown_column_policy() {
        let row = image(json!({"id": 1, "nickname": "x"}));
        assert!(schema(UnknownColumns::Accept).check(&row).is_ok());
        assert!(matches!(
            schema(UnknownColumns::Reject).check(&row),
            Err(SinkError::SchemaConflict { column, .. }) if column == "nickname"
        ));
    }

    #[test]
    fn test_type_mismatch_is_conflict() {
        let err = schema(UnknownColumns::Accept)
            .check(&image(json!({"id": "one"})))
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(schema(UnknownColumns::Accept)
            .check(&image(json!({"id": 1.5})))
            .is_err());
        assert!(TableSchema::default().check(&image(json!({"id": "one"}))).is_ok());
    }
}
