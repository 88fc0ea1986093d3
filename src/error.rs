//! Error taxonomy of the relay
use thiserror::Error;

use crate::event::{Sequence, SourceId};

/// Failures of the source change log
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// The log is not reachable right now. Retry with backoff.
    #[error("source log unavailable: {0}")]
    SourceUnavailable(String),

    /// The requested resume position was purged by the source.
    /// The pipeline of this source halts until it is resnapshotted.
    #[error("resume position {resume:?} of {source_id} is gone, log purged through {purged_through}")]
    SequenceGone {
        source_id: SourceId,
        resume: Option<Sequence>,
        purged_through: Sequence,
    },

    #[error("source {0} already has an active reader")]
    DuplicateReader(SourceId),

    /// A log line that cannot be decoded. The reader stops in front of it.
    #[error("unreadable entry in {log} at byte {offset}: {reason}")]
    UnreadableEntry {
        log: String,
        offset: u64,
        reason: String,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::SourceUnavailable(_))
    }
}

/// A raw entry that cannot be turned into a change event
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed entry at sequence {sequence}: {reason}")]
pub struct MalformedEntry {
    pub sequence: Sequence,
    pub reason: String,
}

impl MalformedEntry {
    pub fn new(sequence: Sequence, reason: impl Into<String>) -> MalformedEntry {
        MalformedEntry {
            sequence,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("partition {0} is full")]
    Full(u32),

    #[error("no such partition {0}")]
    UnknownPartition(u32),

    #[error("codec: {0}")]
    Codec(String),

    #[error("topic {topic} has {found} partitions, relay is configured for {expected}")]
    PartitionMismatch {
        topic: String,
        expected: u32,
        found: u32,
    },
}

impl TransportError {
    /// Codec failures are not going to fix themselves on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_) | TransportError::Full(_))
    }
}

/// Publishing gave up after its bounded retries
#[derive(Error, Debug, Clone)]
#[error("publish of sequence {sequence} to partition {partition} rejected after {attempts} attempts: {cause}")]
pub struct PublishRejected {
    pub sequence: Sequence,
    pub partition: u32,
    pub attempts: u32,
    pub cause: TransportError,
}

#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// Write did not go through; retried until it does
    #[error("sink write failed: {0}")]
    Transient(String),

    #[error("schema conflict on column {column}: expected {expected}, found {found}")]
    SchemaConflict {
        column: String,
        expected: String,
        found: String,
    },

    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid checkpoint key {0:?}")]
    InvalidKey(String),
}

/// Anything that can stop a relay pipeline or one of its lanes
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Malformed(#[from] MalformedEntry),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishRejected),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("unknown relay {0}")]
    UnknownRelay(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Source(e) => e.is_transient(),
            RelayError::Transport(e) => e.is_transient(),
            RelayError::Publish(_) => true,
            RelayError::Sink(e) => e.is_transient(),
            RelayError::Checkpoint(CheckpointError::Io(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::from(SourceError::SourceUnavailable("down".into())).is_transient());
        let gone = SourceError::SequenceGone {
            source_id: SourceId::new("db", "public", "t"),
            resume: Some(Sequence(3)),
            purged_through: Sequence(10),
        };
        assert!(!RelayError::from(gone).is_transient());
        assert!(!RelayError::from(MalformedEntry::new(Sequence(1), "bad op")).is_transient());
        assert!(RelayError::from(SinkError::Transient("timeout".into())).is_transient());
        assert!(!RelayError::from(SinkError::Permanent("boom".into())).is_transient());
        assert!(!TransportError::Codec("bad".into()).is_transient());
    }
}
