//! Kafka topic as transport. One topic per relay, one lane per partition,
//! cursors kept as consumer group offsets.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    producer::{FutureProducer, FutureRecord, Producer},
    Message, Offset as KafkaOffset, TopicPartitionList,
};
use tracing::{debug, warn};

use super::{Delivery, LaneConsumer, Offset, Transport};
use crate::{codec::Codec, error::TransportError, event::ChangeEvent};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaTransport {
    brokers: String,
    topic: String,
    group_id: String,
    partitions: u32,
    producer: FutureProducer,
    codec: Arc<Codec>,
}

impl KafkaTransport {
    pub fn new(
        brokers: &str,
        topic: &str,
        group_id: &str,
        partitions: u32,
        codec: Codec,
    ) -> Result<KafkaTransport, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all") // acknowledged only once replicated
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "1")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(classify)?;
        Ok(KafkaTransport {
            brokers: brokers.to_owned(),
            topic: topic.to_owned(),
            group_id: group_id.to_owned(),
            partitions: partitions.max(1),
            producer,
            codec: Arc::new(codec),
        })
    }
}

impl KafkaTransport {
    /// Fails when the topic exists with a partition count other than the
    /// configured one. Events would otherwise land on partitions no lane reads.
    pub async fn verify_partitions(&self) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let found = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .filter(|t| t.name() == topic && t.error().is_none())
                        .map(|t| t.partitions().len() as u32)
                        .sum::<u32>()
                })
        })
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?
        .map_err(classify)?;
        check_partition_count(&self.topic, self.partitions, found)
    }
}

fn check_partition_count(topic: &str, expected: u32, found: u32) -> Result<(), TransportError> {
    match found {
        0 => {
            warn!(topic, expected, "topic does not exist yet, create it with {expected} partitions");
            Ok(())
        }
        n if n == expected => Ok(()),
        n => Err(TransportError::PartitionMismatch {
            topic: topic.to_owned(),
            expected,
            found: n,
        }),
    }
}

fn classify(e: KafkaError) -> TransportError {
    match e {
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => TransportError::Full(0),
        KafkaError::MessageProduction(RDKafkaErrorCode::UnknownPartition) => {
            TransportError::UnknownPartition(0)
        }
        e => TransportError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn name(&self) -> String {
        format!("kafka:{}", self.topic)
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, partition: u32, event: &ChangeEvent) -> Result<Offset, TransportError> {
        let payload = self.codec.encode(event)?;
        let record = FutureRecord::to(&self.topic)
            .partition(partition as i32)
            .key(event.key.as_str())
            .payload(&payload);
        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((_, offset)) => Ok(offset as Offset),
            Err((e, _)) => Err(match classify(e) {
                TransportError::Full(_) => TransportError::Full(partition),
                TransportError::UnknownPartition(_) => TransportError::UnknownPartition(partition),
                other => other,
            }),
        }
    }

    async fn high_watermark(&self, partition: u32) -> Result<Offset, TransportError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let (_, high) = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_watermarks(&topic, partition as i32, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?
        .map_err(classify)?;
        Ok(high.max(0) as Offset)
    }

    async fn subscribe(&self, partition: u32) -> Result<Box<dyn LaneConsumer>, TransportError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.auto.commit", "false") // lanes commit after the sink write
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(classify)?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition as i32, KafkaOffset::Stored)
            .map_err(classify)?;
        consumer.assign(&tpl).map_err(classify)?;
        debug!(topic = %self.topic, partition, "assigned lane consumer");
        Ok(Box::new(KafkaLane {
            topic: self.topic.clone(),
            partition,
            consumer,
            codec: self.codec.clone(),
        }))
    }
}

struct KafkaLane {
    topic: String,
    partition: u32,
    consumer: StreamConsumer,
    codec: Arc<Codec>,
}

#[async_trait]
impl LaneConsumer for KafkaLane {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    if batch.is_empty() {
                        return Err(classify(e));
                    }
                    warn!(topic = %self.topic, partition = self.partition, "error receiving message: {e}");
                    break;
                }
                Ok(Ok(msg)) => {
                    let payload = msg
                        .payload()
                        .ok_or_else(|| TransportError::Codec("message without payload".into()))?;
                    batch.push(Delivery {
                        partition: self.partition,
                        offset: msg.offset() as Offset,
                        event: self.codec.decode(payload)?,
                    });
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, next: Offset) -> Result<(), TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.topic,
            self.partition as i32,
            KafkaOffset::Offset(next as i64),
        )
        .map_err(classify)?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(classify)
    }

    async fn committed(&self) -> Result<Option<Offset>, TransportError> {
        let tpl = self.consumer.committed(METADATA_TIMEOUT).map_err(classify)?;
        Ok(tpl
            .find_partition(&self.topic, self.partition as i32)
            .and_then(|e| e.offset().to_raw())
            .filter(|o| *o >= 0)
            .map(|o| o as Offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)),
            TransportError::Full(_)
        ));
        assert!(classify(KafkaError::MessageProduction(RDKafkaErrorCode::BrokerTransportFailure))
            .is_transient());
    }

    #[test]
    fn test_partition_count_must_match() {
        assert!(check_partition_count("cdc.inventory.public.users", 4, 4).is_ok());
        assert!(check_partition_count("cdc.inventory.public.users", 4, 0).is_ok());
        match check_partition_count("cdc.inventory.public.users", 4, 6) {
            Err(e @ TransportError::PartitionMismatch { expected: 4, found: 6, .. }) => {
                assert!(!e.is_transient());
                assert!(e.to_string().contains("6 partitions"));
            }
            other => panic!("expected PartitionMismatch, got {other:?}"),
        }
    }
}
