//! Wire encoding of change events on the transport
use std::io::BufReader;

use apache_avro::{from_avro_datum, from_value, to_avro_datum, to_value, Schema};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::{
    error::TransportError,
    event::{ChangeEvent, Key, Operation, RowImage, Sequence, SourceId},
};

/// Confluent [header](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format) length
pub const CONFLUENT_HEADER_LEN: usize = 5;

const WIRE_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "change_event",
    "namespace": "walrelay",
    "fields": [
        {"name": "database", "type": "string"},
        {"name": "schema", "type": "string"},
        {"name": "table", "type": "string"},
        {"name": "key", "type": "string"},
        {"name": "operation", "type": "string"},
        {"name": "after_image", "type": "string"},
        {"name": "sequence", "type": "long"},
        {"name": "commit_ts_ms", "type": "long"}
    ]
}
"#;

/// Flat record carried in Avro; `after_image` is JSON text, empty for deletes
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    database: String,
    schema: String,
    table: String,
    key: String,
    operation: String,
    after_image: String,
    sequence: i64,
    commit_ts_ms: i64,
}

pub enum Codec {
    Json,
    Avro { schema: Schema, schema_id: u32 },
}

impl Codec {
    /// Creates codec of specified name.
    /// If you add your own codecs, register them here
    pub fn from_name(name: &str) -> Result<Codec, TransportError> {
        match name {
            "json" => Ok(Codec::Json),
            "avro" => Codec::avro(1),
            _ => Err(TransportError::Codec(format!("unknown codec {name}"))),
        }
    }

    pub fn avro(schema_id: u32) -> Result<Codec, TransportError> {
        let schema = Schema::parse_str(WIRE_SCHEMA).map_err(codec_err)?;
        Ok(Codec::Avro { schema, schema_id })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Avro { .. } => "avro",
        }
    }

    pub fn encode(&self, event: &ChangeEvent) -> Result<Vec<u8>, TransportError> {
        match self {
            Codec::Json => serde_json::to_vec(event).map_err(codec_err),
            Codec::Avro { schema, schema_id } => {
                let wire = to_wire(event)?;
                let datum = to_avro_datum(schema, to_value(&wire).map_err(codec_err)?)
                    .map_err(codec_err)?;
                let mut out = Vec::with_capacity(CONFLUENT_HEADER_LEN + datum.len());
                out.push(0);
                out.extend_from_slice(&schema_id.to_be_bytes());
                out.extend_from_slice(&datum);
                Ok(out)
            }
        }
    }

    pub fn decode(&self, message: &[u8]) -> Result<ChangeEvent, TransportError> {
        match self {
            Codec::Json => serde_json::from_slice(message).map_err(codec_err),
            Codec::Avro { schema, .. } => {
                if message.len() < CONFLUENT_HEADER_LEN || message[0] != 0 {
                    return Err(TransportError::Codec("missing avro wire header".into()));
                }
                let mut datum = BufReader::new(&message[CONFLUENT_HEADER_LEN..]);
                let v = from_avro_datum(schema, &mut datum, None).map_err(codec_err)?;
                from_wire(from_value::<WireEvent>(&v).map_err(codec_err)?)
            }
        }
    }
}

fn to_wire(event: &ChangeEvent) -> Result<WireEvent, TransportError> {
    let after_image = match &event.after_image {
        Some(image) => serde_json::to_string(image).map_err(codec_err)?,
        None => String::new(),
    };
    Ok(WireEvent {
        database: event.source_id.database.clone(),
        schema: event.source_id.schema.clone(),
        table: event.source_id.table.clone(),
        key: event.key.as_str().to_owned(),
        operation: event.operation.as_str().to_owned(),
        after_image,
        sequence: i64::try_from(event.sequence.0)
            .map_err(|_| TransportError::Codec(format!("sequence {} overflows long", event.sequence)))?,
        commit_ts_ms: event.commit_timestamp.timestamp_millis(),
    })
}

fn from_wire(w: WireEvent) -> Result<ChangeEvent, TransportError> {
    let operation = match w.operation.as_str() {
        "CREATE" => Operation::Create,
        "UPDATE" => Operation::Update,
        "DELETE" => Operation::Delete,
        other => return Err(TransportError::Codec(format!("unknown operation {other}"))),
    };
    let after_image = if w.after_image.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<RowImage>(&w.after_image).map_err(codec_err)?)
    };
    let key_value: serde_json::Value = serde_json::from_str(&w.key).map_err(codec_err)?;
    let key = Key::from_value(&key_value)
        .ok_or_else(|| TransportError::Codec("null key on the wire".into()))?;
    let sequence = u64::try_from(w.sequence)
        .map_err(|_| TransportError::Codec(format!("negative sequence {}", w.sequence)))?;
    let commit_timestamp = DateTime::from_timestamp_millis(w.commit_ts_ms)
        .ok_or_else(|| TransportError::Codec(format!("bad timestamp {}", w.commit_ts_ms)))?;
    Ok(ChangeEvent {
        source_id: SourceId {
            database: w.database,
            schema: w.schema,
            table: w.table,
        },
        key,
        operation,
        after_image,
        sequence: Sequence(sequence),
        commit_timestamp,
    })
}

fn codec_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Codec(e.to_string())
}
