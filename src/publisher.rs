//! Ordered publisher: key-hash partitioning onto the transport with bounded
//! retries. Callers only advance their read position on `Ok`.
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    error::PublishRejected,
    event::{partition_for, ChangeEvent, Key},
    retry::Backoff,
    transport::{Offset, Transport},
};

/// Where an event landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub partition: u32,
    pub offset: Offset,
}

pub struct OrderedPublisher {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
}

impl OrderedPublisher {
    pub fn new(transport: Arc<dyn Transport>, backoff: Backoff) -> OrderedPublisher {
        OrderedPublisher { transport, backoff }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn partition_of(&self, key: &Key) -> u32 {
        partition_for(key, self.transport.partitions())
    }

    /// Appends the event to its key's partition. Within a partition, append
    /// order equals call order as long as calls are not made concurrently.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<Published, PublishRejected> {
        let partition = self.partition_of(&event.key);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.transport.append(partition, event).await {
                Ok(offset) => {
                    debug!(
                        source = %event.source_id,
                        sequence = %event.sequence,
                        partition,
                        offset,
                        "published"
                    );
                    return Ok(Published { partition, offset });
                }
                Err(e) if e.is_transient() && self.backoff.should_retry(attempts) => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        sequence = %event.sequence,
                        partition,
                        attempts,
                        "publish failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    sleep(delay).await;
                }
                Err(cause) => {
                    return Err(PublishRejected {
                        sequence: event.sequence,
                        partition,
                        attempts,
                        cause,
                    })
                }
            }
        }
    }
}
