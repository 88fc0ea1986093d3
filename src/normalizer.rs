//! Turns raw log entries into canonical change events
use chrono::DateTime;
use serde_json::{Map, Value};

use crate::{
    error::MalformedEntry,
    event::{ChangeEvent, Key, Operation, SourceId},
    source::RawEntry,
};

/// Column a delete-rewriting source sets on the synthetic update it emits
pub const DELETED_MARKER: &str = "__deleted";

pub struct Normalizer {
    source_id: SourceId,
    primary_key: Vec<String>,
}

impl Normalizer {
    pub fn new(source_id: SourceId, primary_key: Vec<String>) -> Normalizer {
        Normalizer {
            source_id,
            primary_key,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn normalize(&self, raw: RawEntry) -> Result<ChangeEvent, MalformedEntry> {
        let source_id = self.source_of(&raw)?;
        let operation = operation_of(&raw)?;
        let key = key_of(&raw, operation, &self.primary_key)?;
        let commit_timestamp = DateTime::from_timestamp_millis(raw.ts_ms).ok_or_else(|| {
            MalformedEntry::new(raw.sequence, format!("commit timestamp {} out of range", raw.ts_ms))
        })?;

        if operation == Operation::Delete {
            // emitted even when no prior row state is known
            return Ok(ChangeEvent::tombstone(
                source_id,
                key,
                raw.sequence,
                commit_timestamp,
            ));
        }

        let mut after = match raw.after {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(MalformedEntry::new(
                    raw.sequence,
                    format!("row image must be an object, got {}", kind(&other)),
                ))
            }
            None => {
                return Err(MalformedEntry::new(
                    raw.sequence,
                    format!("{operation} without row image"),
                ))
            }
        };
        after.remove(DELETED_MARKER);
        Ok(ChangeEvent::upsert(
            source_id,
            key,
            operation,
            after,
            raw.sequence,
            commit_timestamp,
        ))
    }

    fn source_of(&self, raw: &RawEntry) -> Result<SourceId, MalformedEntry> {
        let Some(src) = &raw.source else {
            return Ok(self.source_id.clone());
        };
        let id = SourceId {
            database: src.db.clone(),
            schema: src
                .schema
                .clone()
                .unwrap_or_else(|| self.source_id.schema.clone()),
            table: src.table.clone(),
        };
        if id != self.source_id {
            return Err(MalformedEntry::new(
                raw.sequence,
                format!("entry of {id} in the log of {}", self.source_id),
            ));
        }
        Ok(id)
    }
}

/// Maps a source operation code to a change operation.
pub fn operation_of(raw: &RawEntry) -> Result<Operation, MalformedEntry> {
    let op = match raw.op.to_ascii_lowercase().as_str() {
        "c" | "create" | "insert" | "r" | "read" => Operation::Create,
        "u" | "update" => Operation::Update,
        "d" | "delete" => Operation::Delete,
        "t" | "truncate" => {
            return Err(MalformedEntry::new(
                raw.sequence,
                "truncate is not a row change",
            ))
        }
        other => {
            return Err(MalformedEntry::new(
                raw.sequence,
                format!("unknown operation code {other:?}"),
            ))
        }
    };
    if op != Operation::Delete && is_rewritten_delete(raw.after.as_ref()) {
        return Ok(Operation::Delete);
    }
    Ok(op)
}

fn is_rewritten_delete(after: Option<&Value>) -> bool {
    match after.and_then(|a| a.get(DELETED_MARKER)) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Primary key of an entry: the explicit key if given, otherwise the primary
/// key columns of the row image (the prior image for deletes).
pub fn key_of(
    raw: &RawEntry,
    operation: Operation,
    primary_key: &[String],
) -> Result<Key, MalformedEntry> {
    let value = match &raw.key {
        Some(k) if !k.is_null() => canonical_key(k.clone(), primary_key),
        _ => {
            let image = match operation {
                Operation::Delete => raw.before.as_ref().or(raw.after.as_ref()),
                _ => raw.after.as_ref(),
            }
            .ok_or_else(|| MalformedEntry::new(raw.sequence, "no key and no row image"))?;
            key_from_image(image, primary_key)
                .map_err(|reason| MalformedEntry::new(raw.sequence, reason))?
        }
    };
    Key::from_value(&value).ok_or_else(|| MalformedEntry::new(raw.sequence, "null key"))
}

fn key_from_image(image: &Value, primary_key: &[String]) -> Result<Value, String> {
    if primary_key.is_empty() {
        return Err("no primary key columns declared".into());
    }
    let mut parts = Map::new();
    for column in primary_key {
        match image.get(column) {
            None | Some(Value::Null) => return Err(format!("key column {column} missing or null")),
            Some(v) => {
                parts.insert(column.clone(), v.clone());
            }
        }
    }
    Ok(canonical_key(Value::Object(parts), primary_key))
}

/// Single-column keys collapse to the bare column value so that explicit and
/// derived keys of the same row compare equal.
fn canonical_key(value: Value, primary_key: &[String]) -> Value {
    match (value, primary_key) {
        (Value::Object(mut map), [column]) if map.len() == 1 && map.contains_key(column) => {
            map.remove(column).unwrap_or(Value::Null)
        }
        (Value::Object(map), _) if map.values().any(Value::is_null) => Value::Null,
        (value, _) => value,
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
