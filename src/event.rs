//! Canonical change event and the identifiers it carries
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Source-log position. Totally ordered within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical source: database + schema + table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl SourceId {
    pub fn new(database: &str, schema: &str, table: &str) -> SourceId {
        SourceId {
            database: database.to_owned(),
            schema: schema.to_owned(),
            table: table.to_owned(),
        }
    }

    /// Parses `database.schema.table`.
    pub fn parse(s: &str) -> Option<SourceId> {
        let mut parts = s.splitn(3, '.');
        let (db, schema, table) = (parts.next()?, parts.next()?, parts.next()?);
        if db.is_empty() || schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(SourceId::new(db, schema, table))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// Primary-key value of a row, held as compact canonical JSON.
///
/// `serde_json` keeps object keys sorted, so two keys built from equal
/// values always render to the same string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// `None` for JSON null: a key is never null.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Null => None,
            v => Some(Key(v.to_string())),
        }
    }

    /// Wraps text that is already canonical, as read back from a store.
    pub fn from_canonical(s: String) -> Key {
        Key(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| Value::String(self.0.clone()))
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Key {
        Key(v.to_string())
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Key {
        Key(Value::from(v).to_string())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full row state after a mutation
pub type RowImage = Map<String, Value>;

/// One decoded row mutation. Never mutated after the normalizer creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_id: SourceId,
    pub key: Key,
    pub operation: Operation,
    /// absent for DELETE
    pub after_image: Option<RowImage>,
    pub sequence: Sequence,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn upsert(
        source_id: SourceId,
        key: Key,
        operation: Operation,
        after_image: RowImage,
        sequence: Sequence,
        commit_timestamp: DateTime<Utc>,
    ) -> ChangeEvent {
        ChangeEvent {
            source_id,
            key,
            operation,
            after_image: Some(after_image),
            sequence,
            commit_timestamp,
        }
    }

    pub fn tombstone(
        source_id: SourceId,
        key: Key,
        sequence: Sequence,
        commit_timestamp: DateTime<Utc>,
    ) -> ChangeEvent {
        ChangeEvent {
            source_id,
            key,
            operation: Operation::Delete,
            after_image: None,
            sequence,
            commit_timestamp,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}

/// Deterministic partition for a key.
///
/// FNV-1a over the canonical key text: the result must stay stable across
/// process restarts and toolchain upgrades while events are in flight, which
/// rules out `DefaultHasher`.
pub fn partition_for(key: &Key, partitions: u32) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in key.as_str().as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_canonical() {
        let a = Key::from_value(&json!({"b": 2, "a": 1})).unwrap();
        let b = Key::from_value(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"a":1,"b":2}"#);
        assert_eq!(Key::from(333), Key::from_value(&json!(333)).unwrap());
        assert!(Key::from_value(&Value::Null).is_none());
    }

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let key = Key::from(333);
        let p = partition_for(&key, 8);
        assert!(p < 8);
        for _ in 0..10 {
            assert_eq!(partition_for(&key, 8), p);
        }
        assert_eq!(partition_for(&key, 1), 0);
        assert_eq!(partition_for(&key, 0), 0);
    }

    #[test]
    fn test_source_id_roundtrip() {
        let id = SourceId::new("inventory", "public", "users");
        assert_eq!(id.to_string(), "inventory.public.users");
        assert_eq!(SourceId::parse("inventory.public.users"), Some(id));
        assert_eq!(SourceId::parse("inventory.users"), None);
    }
}
