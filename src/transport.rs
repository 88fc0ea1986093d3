//! Durable, partitioned, ordered transport between publisher and lanes.
//!
//! Appends to one partition are delivered in append order. Delivery is
//! at-least-once: anything past a lane's committed cursor is delivered again
//! when the lane reconnects.
pub mod kafka;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::{error::TransportError, event::ChangeEvent};

/// Position of a message within its partition
pub type Offset = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: Offset,
    pub event: ChangeEvent,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> String;

    fn partitions(&self) -> u32;

    /// Durably appends the event; returns its offset once acknowledged.
    async fn append(&self, partition: u32, event: &ChangeEvent) -> Result<Offset, TransportError>;

    /// Offset the next append to `partition` will get.
    async fn high_watermark(&self, partition: u32) -> Result<Offset, TransportError>;

    /// Attaches a consumer to one partition, resuming from its committed cursor.
    async fn subscribe(&self, partition: u32) -> Result<Box<dyn LaneConsumer>, TransportError>;
}

/// Consumer side of one partition
#[async_trait]
pub trait LaneConsumer: Send + Sync {
    fn partition(&self) -> u32;

    /// Up to `max` deliveries in partition order, waiting no longer than
    /// `timeout`. An empty batch means nothing arrived.
    async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Durably records that everything before `next` has been applied.
    async fn commit(&mut self, next: Offset) -> Result<(), TransportError>;

    /// Last committed cursor, if any.
    async fn committed(&self) -> Result<Option<Offset>, TransportError>;
}
